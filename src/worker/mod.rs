//! Background sweeps that keep payments moving without an external trigger.
//!
//! Two loops run side by side: one fails payments whose checkout window has
//! passed, the other replays webhook payloads queued in the retry ledger.
//! Each pass is bounded by a batch size and a deadline, and every record is
//! written on its own, so an abandoned pass loses nothing already done.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::WorkerConfig,
    domain::{CallbackRetry, CallbackRetryStatus, PaymentCallback, PaymentStatus},
    error::Result,
    payments::{CallbackProcessor, CallbackRetryLedger, PaymentStateMachine},
    repository::PaymentRepository,
    service::ServiceContext,
};

const MAX_REPORTED_ERRORS: usize = 5;

pub const EXPIRED_ERROR_CODE: &str = "expired";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// First few failure messages, for the log line.
    pub errors: Vec<String>,
}

impl SweepReport {
    fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    fn failure(&mut self, message: String) {
        self.processed += 1;
        self.failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }
}

pub struct Worker {
    payments: Arc<dyn PaymentRepository>,
    processor: Arc<CallbackProcessor>,
    ledger: Arc<CallbackRetryLedger>,
    state_machine: PaymentStateMachine,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(ctx: &ServiceContext, config: WorkerConfig) -> Self {
        Self {
            payments: ctx.payment_repo.clone(),
            processor: ctx.callback_processor.clone(),
            ledger: ctx.retry_ledger.clone(),
            state_machine: PaymentStateMachine::new(ctx.clock.clone()),
            clock: ctx.clock.clone(),
            config,
        }
    }

    /// Spawns both loops. Each runs a pass immediately, then on its interval,
    /// until `shutdown` fires. A pass already underway is allowed to finish.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            expire_every_secs = self.config.expire_interval_secs,
            retry_every_secs = self.config.retry_interval_secs,
            "Starting payment worker"
        );

        let expire = {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.expire_loop(shutdown).await })
        };
        let retries = {
            let worker = self;
            tokio::spawn(async move { worker.retry_loop(shutdown).await })
        };

        vec![expire, retries]
    }

    async fn expire_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(secs(self.config.expire_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_expire().await;
                }
            }
        }
        tracing::info!("Expiry sweep stopped");
    }

    async fn retry_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(secs(self.config.retry_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_retries().await;
                }
            }
        }
        tracing::info!("Callback retry sweep stopped");
    }

    /// One expiry pass under its deadline. `None` if it failed or ran out of time.
    pub async fn run_expire(&self) -> Option<SweepReport> {
        let deadline = secs(self.config.expire_timeout_secs);
        match tokio::time::timeout(deadline, self.expire_payments()).await {
            Ok(Ok(report)) => {
                log_report("expire_payments", &report);
                Some(report)
            }
            Ok(Err(e)) => {
                tracing::error!("Expiry sweep failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "Expiry sweep hit its deadline");
                None
            }
        }
    }

    /// One retry pass under its deadline. `None` if it failed or ran out of time.
    pub async fn run_retries(&self) -> Option<SweepReport> {
        let deadline = secs(self.config.retry_timeout_secs);
        match tokio::time::timeout(deadline, self.process_callback_retries()).await {
            Ok(Ok(report)) => {
                log_report("process_callback_retries", &report);
                Some(report)
            }
            Ok(Err(e)) => {
                tracing::error!("Callback retry sweep failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "Callback retry sweep hit its deadline");
                None
            }
        }
    }

    /// Fails pending and processing payments whose `expires_at` has passed.
    pub async fn expire_payments(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self
            .payments
            .list_expired(
                &[PaymentStatus::Pending, PaymentStatus::Processing],
                now,
                self.config.expire_batch_size,
            )
            .await?;

        let mut report = SweepReport::default();
        for mut payment in expired {
            let previous = payment.status;
            if let Err(e) = self
                .state_machine
                .validate_status_transition(previous, PaymentStatus::Failed)
            {
                report.failure(format!("{}: {}", payment.id, e));
                continue;
            }

            payment.status = PaymentStatus::Failed;
            payment.error_code = Some(EXPIRED_ERROR_CODE.to_string());
            payment.error_message = Some("Payment expired before completion".to_string());
            payment.updated_at = now;

            match self.payments.update(&payment, previous).await {
                Ok(_) => {
                    tracing::info!(payment_id = %payment.id, from = %previous, "Payment expired");
                    report.success();
                }
                Err(e) => {
                    tracing::warn!(payment_id = %payment.id, "Failed to expire payment: {}", e);
                    report.failure(format!("{}: {}", payment.id, e));
                }
            }
        }

        Ok(report)
    }

    /// Replays due ledger entries through the callback processor.
    pub async fn process_callback_retries(&self) -> Result<SweepReport> {
        self.ledger
            .release_stale(chrono::Duration::seconds(self.config.retry_timeout_secs as i64))
            .await?;

        let due = self.ledger.due(self.config.retry_batch_size).await?;
        let mut report = SweepReport::default();

        for entry in due {
            let entry_id = entry.id;
            let mut entry = match self.ledger.claim(entry).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    report.failure(format!("{}: claim failed: {}", entry_id, e));
                    continue;
                }
            };

            match self.retry_entry(&mut entry).await {
                Ok(()) => report.success(),
                Err(message) => report.failure(format!("{}: {}", entry.id, message)),
            }

            if let Err(e) = self.ledger.persist(&entry).await {
                // Stays claimed until the lease runs out.
                tracing::error!(retry_id = %entry.id, "Failed to save callback retry: {}", e);
            }
        }

        Ok(report)
    }

    /// Runs one attempt and moves `entry` to its next state. The caller
    /// saves it.
    async fn retry_entry(&self, entry: &mut CallbackRetry) -> std::result::Result<(), String> {
        let callback: PaymentCallback = match serde_json::from_str(&entry.callback_data) {
            Ok(cb) => cb,
            Err(e) => {
                let message = format!("stored payload is unreadable: {}", e);
                self.ledger.mark_failed(entry, &message);
                return Err(message);
            }
        };

        match self.processor.handle(&entry.invoice_id, &callback).await {
            Ok(outcome) => {
                self.ledger.mark_completed(entry);
                tracing::info!(
                    retry_id = %entry.id,
                    payment_id = %outcome.payment_id,
                    status = %outcome.status,
                    attempts = entry.retry_count + 1,
                    "Callback retry applied"
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                let message = e.to_string();
                self.ledger.increment_retry(entry, &message);
                if entry.status == CallbackRetryStatus::Failed {
                    tracing::error!(
                        retry_id = %entry.id,
                        invoice_id = %entry.invoice_id,
                        attempts = entry.retry_count,
                        "Callback retries exhausted, needs manual follow-up: {}",
                        message
                    );
                } else {
                    tracing::warn!(
                        retry_id = %entry.id,
                        attempt = entry.retry_count,
                        next_retry_at = ?entry.next_retry_at,
                        "Callback retry failed: {}",
                        message
                    );
                }
                Err(message)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    retry_id = %entry.id,
                    invoice_id = %entry.invoice_id,
                    "Callback retry failed permanently: {}",
                    message
                );
                self.ledger.mark_failed(entry, &message);
                Err(message)
            }
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

fn log_report(job: &str, report: &SweepReport) {
    if report.failed > 0 {
        tracing::warn!(
            job,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            errors = ?report.errors,
            "Sweep finished with failures"
        );
    } else if report.processed > 0 {
        tracing::info!(job, processed = report.processed, "Sweep finished");
    } else {
        tracing::debug!(job, "Sweep found nothing to do");
    }
}
