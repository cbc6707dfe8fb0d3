pub mod payment_service;

use std::sync::Arc;
use sqlx::SqlitePool;

use crate::{
    clock::Clock,
    config::Settings,
    payments::{CallbackProcessor, CallbackRetryLedger, PaymentGateway, PaymentStateMachine},
    repository::*,
};
use payment_service::PaymentService;

/// Every long-lived component, wired once at startup and shared by the HTTP
/// layer and the worker.
pub struct ServiceContext {
    pub payment_repo: Arc<dyn PaymentRepository>,
    pub retry_repo: Arc<dyn CallbackRetryRepository>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub callback_processor: Arc<CallbackProcessor>,
    pub retry_ledger: Arc<CallbackRetryLedger>,
    pub payment_service: Arc<PaymentService>,
    pub clock: Arc<dyn Clock>,
    pub db_pool: SqlitePool,
}

impl ServiceContext {
    pub fn new(
        db_pool: SqlitePool,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        let payment_repo = Arc::new(SqlitePaymentRepository::new(db_pool.clone()));
        let retry_repo = Arc::new(SqliteCallbackRetryRepository::new(db_pool.clone()));
        Self::with_repositories(db_pool, payment_repo, retry_repo, gateway, clock, settings)
    }

    pub fn with_repositories(
        db_pool: SqlitePool,
        payment_repo: Arc<dyn PaymentRepository>,
        retry_repo: Arc<dyn CallbackRetryRepository>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        let callback_processor = Arc::new(CallbackProcessor::new(
            payment_repo.clone(),
            PaymentStateMachine::new(clock.clone()),
        ));
        let retry_ledger = Arc::new(CallbackRetryLedger::new(
            retry_repo.clone(),
            clock.clone(),
            settings.payments.callback_max_retries,
        ));

        let payment_service = Arc::new(PaymentService::new(
            payment_repo.clone(),
            gateway.clone(),
            callback_processor.clone(),
            retry_ledger.clone(),
            clock.clone(),
            settings.payments.clone(),
            settings.gateway.clone(),
        ));

        Self {
            payment_repo,
            retry_repo,
            gateway,
            callback_processor,
            retry_ledger,
            payment_service,
            clock,
            db_pool,
        }
    }
}
