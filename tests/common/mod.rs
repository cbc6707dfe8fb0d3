#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use library_payments::{
    clock::{Clock, ManualClock},
    config::Settings,
    domain::{Payment, PaymentMethod, PaymentStatus, PaymentType},
    error::{AppError, GatewayError, Result},
    payments::{AccessToken, ChargeResult, GatewayStatusResponse, PaymentGateway, SavedCardCharge},
    repository::{PaymentRepository, SqlitePaymentRepository},
    service::ServiceContext,
};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub async fn test_pool() -> anyhow::Result<SqlitePool> {
    // One connection so every query sees the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now()))
}

pub fn payment(invoice_id: &str, status: PaymentStatus, now: DateTime<Utc>) -> Payment {
    Payment {
        id: Uuid::new_v4(),
        member_id: Uuid::new_v4(),
        invoice_id: invoice_id.to_string(),
        amount: 5000,
        currency: "KZT".to_string(),
        payment_type: PaymentType::Fine,
        payment_method: PaymentMethod::Card,
        status,
        description: "Overdue book fine".to_string(),
        gateway_transaction_id: None,
        card_mask: None,
        approval_code: None,
        error_code: None,
        error_message: None,
        gateway_response: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
        expires_at: now + Duration::minutes(30),
    }
}

pub fn callback_json(code: &str, reason: &str, invoice_id: &str) -> String {
    serde_json::json!({
        "code": code,
        "invoiceId": invoice_id,
        "amount": 5000,
        "currency": "KZT",
        "reason": reason,
        "id": "txn-7731",
        "cardMask": "440043...0128",
        "approvalCode": "512394",
        "terminal": "67e34d63-102f-4bd1-898e-370781d0074d"
    })
    .to_string()
}

/// Gateway double with canned answers and call counters.
#[derive(Default)]
pub struct StubGateway {
    pub status: Mutex<Option<GatewayStatusResponse>>,
    pub charge: Mutex<Option<std::result::Result<ChargeResult, GatewayError>>>,
    pub refunds: Mutex<Vec<(String, Option<i64>, Option<String>)>>,
    pub cancels: Mutex<Vec<String>>,
    pub checkout_calls: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn get_token(&self) -> std::result::Result<String, GatewayError> {
        Ok("service-token".to_string())
    }

    async fn checkout_token(&self, _payment: &Payment) -> std::result::Result<AccessToken, GatewayError> {
        self.checkout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken {
            token: "checkout-token".to_string(),
            expires_at: Utc::now() + Duration::minutes(20),
        })
    }

    async fn check_status(&self, _invoice_id: &str) -> std::result::Result<GatewayStatusResponse, GatewayError> {
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::Transport("no status configured".to_string()))
    }

    async fn charge_saved_card(&self, _request: &SavedCardCharge) -> std::result::Result<ChargeResult, GatewayError> {
        self.charge
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(GatewayError::Transport("no charge configured".to_string())))
    }

    async fn refund(
        &self,
        transaction_id: &str,
        amount: Option<i64>,
        external_id: Option<&str>,
    ) -> std::result::Result<(), GatewayError> {
        self.refunds.lock().unwrap().push((
            transaction_id.to_string(),
            amount,
            external_id.map(str::to_string),
        ));
        Ok(())
    }

    async fn cancel(&self, transaction_id: &str) -> std::result::Result<(), GatewayError> {
        self.cancels.lock().unwrap().push(transaction_id.to_string());
        Ok(())
    }
}

/// SQLite payments whose next `fail_updates` writes fail like a locked database.
pub struct FlakyPayments {
    pub inner: SqlitePaymentRepository,
    pub fail_updates: AtomicUsize,
}

impl FlakyPayments {
    pub fn new(pool: SqlitePool, fail_updates: usize) -> Self {
        Self {
            inner: SqlitePaymentRepository::new(pool),
            fail_updates: AtomicUsize::new(fail_updates),
        }
    }
}

#[async_trait]
impl PaymentRepository for FlakyPayments {
    async fn create(&self, payment: Payment) -> Result<Payment> {
        self.inner.create(payment).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_invoice_id(&self, invoice_id: &str) -> Result<Option<Payment>> {
        self.inner.find_by_invoice_id(invoice_id).await
    }

    async fn find_by_member(&self, member_id: Uuid) -> Result<Vec<Payment>> {
        self.inner.find_by_member(member_id).await
    }

    async fn update(&self, payment: &Payment, expected_status: PaymentStatus) -> Result<Payment> {
        let remaining = self.fail_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_updates.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Database("database is locked".to_string()));
        }
        self.inner.update(payment, expected_status).await
    }

    async fn list_expired(
        &self,
        statuses: &[PaymentStatus],
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>> {
        self.inner.list_expired(statuses, now, limit).await
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.payments.callback_max_retries = 3;
    settings.gateway.terminal_id = "67e34d63-102f-4bd1-898e-370781d0074d".to_string();
    settings.gateway.post_link = "https://library.example/api/payments/callback".to_string();
    settings
}

pub fn context(
    pool: SqlitePool,
    payments: Arc<dyn PaymentRepository>,
    gateway: Arc<StubGateway>,
    clock: Arc<ManualClock>,
    settings: &Settings,
) -> ServiceContext {
    let retries = Arc::new(library_payments::repository::SqliteCallbackRetryRepository::new(pool.clone()));
    let clock: Arc<dyn Clock> = clock;
    ServiceContext::with_repositories(pool, payments, retries, gateway, clock, settings)
}
