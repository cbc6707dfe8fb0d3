use serde::Deserialize;
use config::{Config, ConfigError, Environment, File};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub payments: PaymentPolicyConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayEnvironment {
    #[default]
    Test,
    Production,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub environment: GatewayEnvironment,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub terminal_id: String,
    /// Overrides the credential-grant URL derived from `environment`.
    pub oauth_url: Option<String>,
    /// Overrides the API base URL derived from `environment`.
    pub api_url: Option<String>,
    /// Where the provider delivers webhook callbacks.
    #[serde(default)]
    pub post_link: String,
    #[serde(default)]
    pub failure_post_link: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Shared secret for inbound callback signatures. Unset disables the check.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentPolicyConfig {
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
    #[serde(default = "default_refund_window_hours")]
    pub refund_window_hours: i64,
    #[serde(default = "default_callback_max_retries")]
    pub callback_max_retries: i32,
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_expire_interval_secs")]
    pub expire_interval_secs: u64,
    #[serde(default = "default_expire_timeout_secs")]
    pub expire_timeout_secs: u64,
    #[serde(default = "default_expire_batch_size")]
    pub expire_batch_size: i64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: i64,
}

const TEST_OAUTH_URL: &str = "https://testoauth.homebank.kz/epay2/oauth2/token";
const TEST_API_URL: &str = "https://testepay.homebank.kz/api";
const PROD_OAUTH_URL: &str = "https://epay-oauth.homebank.kz/oauth2/token";
const PROD_API_URL: &str = "https://epay-api.homebank.kz";

fn default_request_timeout_secs() -> u64 { 30 }
fn default_ttl_minutes() -> i64 { 30 }
fn default_refund_window_hours() -> i64 { 14 * 24 }
fn default_callback_max_retries() -> i32 { 8 }
fn default_currency() -> String { "KZT".to_string() }
fn default_true() -> bool { true }
fn default_expire_interval_secs() -> u64 { 5 * 60 }
fn default_expire_timeout_secs() -> u64 { 2 * 60 }
fn default_expire_batch_size() -> i64 { 100 }
fn default_retry_interval_secs() -> u64 { 2 * 60 }
fn default_retry_timeout_secs() -> u64 { 3 * 60 }
fn default_retry_batch_size() -> i64 { 50 }

impl GatewayConfig {
    pub fn oauth_url(&self) -> &str {
        match (&self.oauth_url, self.environment) {
            (Some(url), _) => url,
            (None, GatewayEnvironment::Test) => TEST_OAUTH_URL,
            (None, GatewayEnvironment::Production) => PROD_OAUTH_URL,
        }
    }

    pub fn api_url(&self) -> &str {
        let url = match (&self.api_url, self.environment) {
            (Some(url), _) => url.as_str(),
            (None, GatewayEnvironment::Test) => TEST_API_URL,
            (None, GatewayEnvironment::Production) => PROD_API_URL,
        };
        url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PaymentPolicyConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes)
    }

    pub fn refund_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.refund_window_hours)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: GatewayEnvironment::Test,
            client_id: String::new(),
            client_secret: String::new(),
            terminal_id: String::new(),
            oauth_url: None,
            api_url: None,
            post_link: String::new(),
            failure_post_link: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            webhook_secret: None,
        }
    }
}

impl Default for PaymentPolicyConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            refund_window_hours: default_refund_window_hours(),
            callback_max_retries: default_callback_max_retries(),
            default_currency: default_currency(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_interval_secs: default_expire_interval_secs(),
            expire_timeout_secs: default_expire_timeout_secs(),
            expire_batch_size: default_expire_batch_size(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_timeout_secs: default_retry_timeout_secs(),
            retry_batch_size: default_retry_batch_size(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.url", "sqlite://library_payments.db?mode=rwc")?
            .set_default("database.max_connections", 10)?

            // Add config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))

            // Add environment variables (with LIBRARY__ prefix, double underscore separates levels)
            .add_source(Environment::with_prefix("LIBRARY").separator("__"))

            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://library_payments.db?mode=rwc".to_string(),
                max_connections: 10,
            },
            gateway: GatewayConfig::default(),
            payments: PaymentPolicyConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}
