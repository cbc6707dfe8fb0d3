use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    clock::Clock,
    domain::{CallbackRetry, CallbackRetryStatus},
    error::Result,
    repository::CallbackRetryRepository,
};

/// Delay before the next attempt, indexed by how many attempts have already
/// failed. Fixed table, no jitter.
pub fn backoff_delay(attempt: i32) -> Duration {
    match attempt {
        i32::MIN..=0 => Duration::minutes(1),
        1 => Duration::minutes(5),
        2 => Duration::minutes(15),
        3 => Duration::hours(1),
        4 => Duration::hours(6),
        _ => Duration::hours(24),
    }
}

pub fn calculate_next_retry_time(attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    now + backoff_delay(attempt)
}

/// Durable queue of webhook payloads whose effect has not been applied yet.
///
/// The entry rules (`should_retry`, `increment_retry`, `mark_*`) only mutate
/// the in-memory entry; callers persist the result with [`Self::persist`] so
/// that one attempt costs one write.
pub struct CallbackRetryLedger {
    repo: Arc<dyn CallbackRetryRepository>,
    clock: Arc<dyn Clock>,
    max_retries: i32,
}

impl CallbackRetryLedger {
    pub fn new(
        repo: Arc<dyn CallbackRetryRepository>,
        clock: Arc<dyn Clock>,
        max_retries: i32,
    ) -> Self {
        Self {
            repo,
            clock,
            max_retries: max_retries.max(1),
        }
    }

    pub fn should_retry(&self, entry: &CallbackRetry) -> bool {
        entry.status == CallbackRetryStatus::Pending
            && entry.retry_count < entry.max_retries
            && entry.next_retry_at.map_or(true, |at| at <= self.clock.now())
    }

    /// Records a failed attempt. Schedules the next one, or ends the entry
    /// once its attempts are used up.
    pub fn increment_retry(&self, entry: &mut CallbackRetry, error: &str) {
        let now = self.clock.now();
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.updated_at = now;

        if entry.retry_count >= entry.max_retries {
            entry.retry_count = entry.max_retries;
            entry.status = CallbackRetryStatus::Failed;
            entry.next_retry_at = None;
        } else {
            entry.status = CallbackRetryStatus::Pending;
            entry.next_retry_at = Some(calculate_next_retry_time(entry.retry_count, now));
        }
    }

    pub fn mark_processing(&self, entry: &mut CallbackRetry) {
        entry.status = CallbackRetryStatus::Processing;
        entry.updated_at = self.clock.now();
    }

    pub fn mark_completed(&self, entry: &mut CallbackRetry) {
        entry.status = CallbackRetryStatus::Completed;
        entry.next_retry_at = None;
        entry.updated_at = self.clock.now();
    }

    /// Ends the entry without using up its remaining attempts. For outcomes
    /// that no amount of retrying will change.
    pub fn mark_failed(&self, entry: &mut CallbackRetry, error: &str) {
        entry.status = CallbackRetryStatus::Failed;
        entry.last_error = Some(error.to_string());
        entry.next_retry_at = None;
        entry.updated_at = self.clock.now();
    }

    /// Stores a payload whose processing failed transiently. An invoice with
    /// an entry still waiting gets that entry refreshed instead of a second
    /// one. A claimed entry is owned by the sweep that holds it, so the new
    /// payload is queued separately.
    pub async fn record_failure(
        &self,
        invoice_id: &str,
        payment_id: Option<Uuid>,
        callback_data: &str,
        error: &str,
    ) -> Result<CallbackRetry> {
        let now = self.clock.now();

        let waiting = self
            .repo
            .find_active_by_invoice(invoice_id)
            .await?
            .filter(|e| e.status == CallbackRetryStatus::Pending);
        if let Some(mut existing) = waiting {
            existing.callback_data = callback_data.to_string();
            existing.last_error = Some(error.to_string());
            existing.payment_id = existing.payment_id.or(payment_id);
            existing.updated_at = now;
            tracing::warn!(
                retry_id = %existing.id,
                invoice_id = %invoice_id,
                error = %error,
                "Callback failed again while a retry was queued"
            );
            return self.repo.update(&existing).await;
        }

        let entry = CallbackRetry {
            id: Uuid::new_v4(),
            payment_id,
            invoice_id: invoice_id.to_string(),
            callback_data: callback_data.to_string(),
            retry_count: 0,
            max_retries: self.max_retries,
            last_error: Some(error.to_string()),
            next_retry_at: Some(calculate_next_retry_time(0, now)),
            status: CallbackRetryStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        tracing::warn!(
            retry_id = %entry.id,
            invoice_id = %invoice_id,
            error = %error,
            "Queued callback for retry"
        );
        self.repo.create(entry).await
    }

    /// Entries the retry sweep may pick up right now.
    pub async fn due(&self, limit: i64) -> Result<Vec<CallbackRetry>> {
        let entries = self.repo.list_pending(self.clock.now(), limit).await?;
        Ok(entries.into_iter().filter(|e| self.should_retry(e)).collect())
    }

    /// Claims an entry for this attempt. The write happens before any work
    /// so a crash leaves it visibly in `processing`.
    pub async fn claim(&self, mut entry: CallbackRetry) -> Result<CallbackRetry> {
        self.mark_processing(&mut entry);
        self.repo.update(&entry).await
    }

    pub async fn persist(&self, entry: &CallbackRetry) -> Result<CallbackRetry> {
        self.repo.update(entry).await
    }

    /// Hands back entries whose claim is older than `lease`.
    pub async fn release_stale(&self, lease: Duration) -> Result<u64> {
        let now = self.clock.now();
        let released = self.repo.release_stale_processing(now - lease, now).await?;
        if released > 0 {
            tracing::warn!(released, "Released stale callback retry claims");
        }
        Ok(released)
    }
}
