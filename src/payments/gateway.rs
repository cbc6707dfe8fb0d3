use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    clock::Clock,
    config::GatewayConfig,
    domain::{GatewayUpdate, Payment},
    error::GatewayError,
    payments::token_cache::{AccessToken, TokenCache},
};

const TOKEN_SCOPE: &str =
    "webapi usermanagement email_send verification statement statistics payment";
const STATUS_OK_RESULT_CODE: &str = "100";

/// Gateway-agnostic snapshot of a transaction as the provider sees it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GatewayStatusResponse {
    pub result_code: String,
    pub result_message: String,
    pub transaction_id: Option<String>,
    pub invoice_id: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    /// Provider status name (e.g. `AUTH`, `CHARGE`, `REFUND`).
    pub status: String,
    pub card_mask: Option<String>,
    pub approval_code: Option<String>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub reason_code: Option<String>,
    pub raw: String,
}

impl GatewayStatusResponse {
    pub fn to_update(&self) -> GatewayUpdate {
        GatewayUpdate {
            transaction_id: self.transaction_id.clone(),
            card_mask: self.card_mask.clone(),
            approval_code: self.approval_code.clone(),
            error_code: self.reason_code.clone().filter(|c| c != "0"),
            error_message: self.reason.clone().filter(|r| !r.eq_ignore_ascii_case("success")),
            raw_response: Some(self.raw.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SavedCardCharge {
    pub invoice_id: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub account_id: String,
    /// Provider-side id of the tokenized card.
    pub card_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChargeResult {
    pub transaction_id: Option<String>,
    pub status: String,
    pub approval_code: Option<String>,
    pub reference: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw: String,
}

impl ChargeResult {
    pub fn to_update(&self) -> GatewayUpdate {
        GatewayUpdate {
            transaction_id: self.transaction_id.clone(),
            card_mask: None,
            approval_code: self.approval_code.clone(),
            error_code: self.error_code.clone(),
            error_message: self.error_message.clone(),
            raw_response: Some(self.raw.clone()),
        }
    }
}

/// Network operations against the payment provider. None of them retry;
/// retry policy belongs to the callback ledger and the worker.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_token(&self) -> Result<String, GatewayError>;
    /// Invoice-scoped token handed to the payer's browser. Never cached.
    async fn checkout_token(&self, payment: &Payment) -> Result<AccessToken, GatewayError>;
    async fn check_status(&self, invoice_id: &str) -> Result<GatewayStatusResponse, GatewayError>;
    async fn charge_saved_card(
        &self,
        request: &SavedCardCharge,
    ) -> Result<ChargeResult, GatewayError>;
    async fn refund(
        &self,
        transaction_id: &str,
        amount: Option<i64>,
        external_id: Option<&str>,
    ) -> Result<(), GatewayError>;
    async fn cancel(&self, transaction_id: &str) -> Result<(), GatewayError>;
}

pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    token_cache: TokenCache,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEnvelope {
    #[serde(default)]
    result_code: Value,
    #[serde(default)]
    result_message: String,
    transaction: Option<TransactionDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDetail {
    id: Option<String>,
    #[serde(rename = "invoiceID")]
    invoice_id: Option<String>,
    amount: Option<Value>,
    currency: Option<String>,
    card_mask: Option<String>,
    approval_code: Option<Value>,
    reference: Option<Value>,
    reason: Option<String>,
    reason_code: Option<Value>,
    #[serde(default)]
    status_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeResponse {
    id: Option<String>,
    status: Option<String>,
    approval_code: Option<Value>,
    reference: Option<Value>,
    code: Option<Value>,
    message: Option<String>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, clock: Arc<dyn Clock>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_cache: TokenCache::new(clock.clone()),
            config,
            clock,
        })
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.token_cache
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url(), path)
    }

    async fn request_token(
        &self,
        extra: Vec<(&'static str, String)>,
    ) -> Result<AccessToken, GatewayError> {
        let mut form: Vec<(&'static str, String)> = vec![
            ("grant_type", "client_credentials".to_string()),
            ("scope", TOKEN_SCOPE.to_string()),
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
            ("terminal", self.config.terminal_id.clone()),
        ];
        form.extend(extra);

        let requested_at = self.clock.now();
        let response = self
            .send(self.http.post(self.config.oauth_url()).form(&form))
            .await?;
        let body: TokenResponse = response.json().await.map_err(|e| {
            GatewayError::InvalidResponse(format!("token response: {}", e))
        })?;

        if body.access_token.is_empty() {
            return Err(GatewayError::InvalidResponse("empty access token".to_string()));
        }
        let expires_at = token_expiry(requested_at, &body.expires_in).ok_or_else(|| {
            GatewayError::InvalidResponse(format!(
                "token expires_in is not a usable lifetime: {}",
                body.expires_in
            ))
        })?;

        Ok(AccessToken {
            token: body.access_token,
            expires_at,
        })
    }

    /// Sends a request and turns anything but a 2xx into a `GatewayError`.
    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request.send().await.map_err(|e| {
            tracing::warn!("Gateway request failed before a response: {}", e);
            GatewayError::Transport(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = parse_error_body(&body, status);
        tracing::warn!(
            status = status.as_u16(),
            code = %code,
            "Gateway rejected request: {}",
            message
        );
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            code,
            message,
        })
    }

    /// `send` for bearer-authenticated API calls. A 401 means the cached
    /// token was revoked early, so it is dropped before the error surfaces.
    async fn send_authorized(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let result = self.send(request).await;
        let unauthorized = matches!(
            &result,
            Err(GatewayError::Rejected { status, .. })
                if *status == StatusCode::UNAUTHORIZED.as_u16()
        );
        if unauthorized {
            self.token_cache.invalidate().await;
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn get_token(&self) -> Result<String, GatewayError> {
        self.token_cache.get_or_refresh(|| self.request_token(Vec::new())).await
    }

    async fn checkout_token(&self, payment: &Payment) -> Result<AccessToken, GatewayError> {
        self.request_token(vec![
            ("invoiceID", payment.invoice_id.clone()),
            ("amount", payment.amount.to_string()),
            ("currency", payment.currency.clone()),
            ("postLink", self.config.post_link.clone()),
            ("failurePostLink", self.config.failure_post_link.clone()),
        ])
        .await
    }

    async fn check_status(&self, invoice_id: &str) -> Result<GatewayStatusResponse, GatewayError> {
        let token = self.get_token().await?;
        let url = self.api_url(&format!(
            "/check-status/payment/transaction/{}",
            urlencoding::encode(invoice_id)
        ));

        let response = self.send_authorized(self.http.get(url).bearer_auth(token)).await?;
        let raw = response.text().await.map_err(GatewayError::from)?;
        let envelope: StatusEnvelope = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::InvalidResponse(format!("status response: {}", e)))?;

        let result_code = value_to_string(&envelope.result_code).unwrap_or_default();
        if result_code != STATUS_OK_RESULT_CODE {
            return Err(GatewayError::Rejected {
                status: StatusCode::OK.as_u16(),
                code: result_code,
                message: envelope.result_message,
            });
        }

        let tx = envelope.transaction.ok_or_else(|| {
            GatewayError::InvalidResponse("status response has no transaction block".to_string())
        })?;

        Ok(GatewayStatusResponse {
            result_code,
            result_message: envelope.result_message,
            transaction_id: tx.id,
            invoice_id: tx.invoice_id,
            amount: tx.amount.as_ref().and_then(value_to_i64),
            currency: tx.currency,
            status: tx.status_name,
            card_mask: tx.card_mask,
            approval_code: tx.approval_code.as_ref().and_then(value_to_string),
            reference: tx.reference.as_ref().and_then(value_to_string),
            reason: tx.reason,
            reason_code: tx.reason_code.as_ref().and_then(value_to_string),
            raw,
        })
    }

    async fn charge_saved_card(
        &self,
        request: &SavedCardCharge,
    ) -> Result<ChargeResult, GatewayError> {
        let token = self.get_token().await?;
        let body = json!({
            "amount": request.amount,
            "currency": request.currency,
            "terminalId": self.config.terminal_id,
            "invoiceId": request.invoice_id,
            "description": request.description,
            "accountId": request.account_id,
            "postLink": self.config.post_link,
            "failurePostLink": self.config.failure_post_link,
            "paymentType": "cardId",
            "cardId": { "id": request.card_id },
        });

        let request_builder = self
            .http
            .post(self.api_url("/payments/cards/auth"))
            .bearer_auth(token)
            .json(&body);
        let response = self.send_authorized(request_builder).await?;
        let raw = response.text().await.map_err(GatewayError::from)?;
        let charge: ChargeResponse = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::InvalidResponse(format!("charge response: {}", e)))?;

        let error_code = charge
            .code
            .as_ref()
            .and_then(value_to_string)
            .filter(|c| c != "0" && !c.eq_ignore_ascii_case("ok"));

        Ok(ChargeResult {
            transaction_id: charge.id,
            status: charge.status.unwrap_or_default(),
            approval_code: charge.approval_code.as_ref().and_then(value_to_string),
            reference: charge.reference.as_ref().and_then(value_to_string),
            error_message: error_code.as_ref().and(charge.message),
            error_code,
            raw,
        })
    }

    async fn refund(
        &self,
        transaction_id: &str,
        amount: Option<i64>,
        external_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let token = self.get_token().await?;
        let url = self.api_url(&format!(
            "/operation/{}/refund",
            urlencoding::encode(transaction_id)
        ));

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(amount) = amount {
            query.push(("amount", amount.to_string()));
        }
        if let Some(external_id) = external_id {
            query.push(("externalID", external_id.to_string()));
        }

        self.send_authorized(self.http.post(url).bearer_auth(token).query(&query)).await?;
        tracing::info!(transaction_id = %transaction_id, ?amount, "Gateway refund accepted");
        Ok(())
    }

    async fn cancel(&self, transaction_id: &str) -> Result<(), GatewayError> {
        let token = self.get_token().await?;
        let url = self.api_url(&format!(
            "/operation/{}/cancel",
            urlencoding::encode(transaction_id)
        ));

        self.send_authorized(self.http.post(url).bearer_auth(token)).await?;
        tracing::info!(transaction_id = %transaction_id, "Gateway cancel accepted");
        Ok(())
    }
}

/// A positive, representable lifetime in seconds added to `requested_at`.
fn token_expiry(requested_at: DateTime<Utc>, expires_in: &Value) -> Option<DateTime<Utc>> {
    let ttl = value_to_i64(expires_in).filter(|secs| *secs > 0)?;
    requested_at.checked_add_signed(Duration::try_seconds(ttl)?)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_error_body(body: &str, status: StatusCode) -> (String, String) {
    let fallback_message = || {
        let trimmed: String = body.chars().take(200).collect();
        if trimmed.is_empty() {
            status.canonical_reason().unwrap_or("unknown error").to_string()
        } else {
            trimmed
        }
    };

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
        return (status.as_u16().to_string(), fallback_message());
    };

    let code = ["code", "errorCode", "resultCode", "error"]
        .iter()
        .find_map(|k| map.get(*k).and_then(value_to_string))
        .unwrap_or_else(|| status.as_u16().to_string());
    let message = ["message", "errorMessage", "resultMessage", "error_description"]
        .iter()
        .find_map(|k| map.get(*k).and_then(value_to_string))
        .unwrap_or_else(fallback_message);

    (code, message)
}
