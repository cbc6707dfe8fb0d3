//! Runs the payment sweeps without the HTTP server.
//!
//! ```text
//! payments-worker                 # both loops until Ctrl-C
//! payments-worker --once          # one pass of each, then exit
//! payments-worker --once --job expire
//! ```

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use library_payments::{
    clock::{Clock, SystemClock},
    config::Settings,
    payments::GatewayClient,
    service::ServiceContext,
    worker::{SweepReport, Worker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Job {
    Expire,
    Retries,
    All,
}

#[derive(Debug, Parser)]
#[command(name = "payments-worker", about = "Payment expiry and callback retry sweeps")]
struct Args {
    /// Run a single pass and exit instead of looping
    #[arg(long)]
    once: bool,

    /// Which sweep to run
    #[arg(long, value_enum, default_value_t = Job::All)]
    job: Job,

    /// Override the database URL from configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "library_payments=debug,payments_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut settings = Settings::new().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}. Using defaults.", e);
        Settings::default()
    });
    if let Some(url) = args.database_url.clone() {
        settings.database.url = url;
    }

    let db_pool = SqlitePoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Arc::new(GatewayClient::new(settings.gateway.clone(), clock.clone())?);
    let ctx = ServiceContext::new(db_pool, gateway, clock, &settings);
    let worker = Arc::new(Worker::new(&ctx, settings.worker.clone()));

    if args.once {
        let mut failed = false;
        if matches!(args.job, Job::Expire | Job::All) {
            failed |= !report_ok(worker.run_expire().await);
        }
        if matches!(args.job, Job::Retries | Job::All) {
            failed |= !report_ok(worker.run_retries().await);
        }
        if failed {
            anyhow::bail!("one or more sweeps did not complete");
        }
        return Ok(());
    }

    if args.job != Job::All {
        tracing::warn!("--job only applies with --once; running both loops");
    }

    let shutdown = CancellationToken::new();
    let handles = worker.start(shutdown.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, waiting for running sweeps");
    shutdown.cancel();

    for handle in handles {
        handle.await?;
    }
    Ok(())
}

fn report_ok(report: Option<SweepReport>) -> bool {
    match report {
        Some(report) => {
            println!(
                "processed={} succeeded={} failed={}",
                report.processed, report.succeeded, report.failed
            );
            true
        }
        None => false,
    }
}
