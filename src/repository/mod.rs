use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use crate::domain::*;
use crate::error::Result;

pub mod payment_repository;
pub mod callback_retry_repository;

pub use payment_repository::SqlitePaymentRepository;
pub use callback_retry_repository::SqliteCallbackRetryRepository;

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn create(&self, payment: Payment) -> Result<Payment>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>>;
    async fn find_by_invoice_id(&self, invoice_id: &str) -> Result<Option<Payment>>;
    async fn find_by_member(&self, member_id: Uuid) -> Result<Vec<Payment>>;
    /// Writes every mutable field, but only if the stored status is still
    /// `expected_status`. Returns `Conflict` otherwise.
    async fn update(&self, payment: &Payment, expected_status: PaymentStatus) -> Result<Payment>;
    /// Payments in one of `statuses` whose `expires_at` is at or before `now`,
    /// oldest expiry first.
    async fn list_expired(
        &self,
        statuses: &[PaymentStatus],
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>>;
}

#[async_trait]
pub trait CallbackRetryRepository: Send + Sync {
    async fn create(&self, entry: CallbackRetry) -> Result<CallbackRetry>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<CallbackRetry>>;
    /// The pending or processing entry for an invoice, if any.
    async fn find_active_by_invoice(&self, invoice_id: &str) -> Result<Option<CallbackRetry>>;
    /// Pending entries with attempts left whose `next_retry_at` is unset or due.
    async fn list_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<CallbackRetry>>;
    async fn update(&self, entry: &CallbackRetry) -> Result<CallbackRetry>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    /// Moves entries stuck in `processing` since before `before` back to
    /// `pending`. Returns how many were released.
    async fn release_stale_processing(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;
}
