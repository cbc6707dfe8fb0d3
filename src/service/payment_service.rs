use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::Clock,
    config::{GatewayConfig, PaymentPolicyConfig},
    domain::*,
    error::{AppError, GatewayError, Result},
    payments::{CallbackProcessor, CallbackRetryLedger, PaymentGateway, PaymentStateMachine, SavedCardCharge},
    repository::PaymentRepository,
};

const INVOICE_ID_ATTEMPTS: usize = 3;

pub struct PaymentService {
    payments: Arc<dyn PaymentRepository>,
    gateway: Arc<dyn PaymentGateway>,
    processor: Arc<CallbackProcessor>,
    ledger: Arc<CallbackRetryLedger>,
    state_machine: PaymentStateMachine,
    clock: Arc<dyn Clock>,
    policy: PaymentPolicyConfig,
    gateway_config: GatewayConfig,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        gateway: Arc<dyn PaymentGateway>,
        processor: Arc<CallbackProcessor>,
        ledger: Arc<CallbackRetryLedger>,
        clock: Arc<dyn Clock>,
        policy: PaymentPolicyConfig,
        gateway_config: GatewayConfig,
    ) -> Self {
        Self {
            payments,
            gateway,
            processor,
            ledger,
            state_machine: PaymentStateMachine::new(clock.clone()),
            clock,
            policy,
            gateway_config,
        }
    }

    pub async fn create_pending_payment(&self, request: CreatePaymentRequest) -> Result<Payment> {
        request
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let now = self.clock.now();
        let currency = request
            .currency
            .unwrap_or_else(|| self.policy.default_currency.clone())
            .to_uppercase();
        let description = request
            .description
            .unwrap_or_else(|| format!("Library {} payment", request.payment_type.as_str()));

        let mut payment = Payment {
            id: Uuid::new_v4(),
            member_id: request.member_id,
            invoice_id: String::new(),
            amount: request.amount,
            currency,
            payment_type: request.payment_type,
            payment_method: request.payment_method,
            status: PaymentStatus::Pending,
            description,
            gateway_transaction_id: None,
            card_mask: None,
            approval_code: None,
            error_code: None,
            error_message: None,
            gateway_response: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: now + self.policy.ttl(),
        };

        // Invoice ids are random; a collision shows up as a unique violation.
        for attempt in 1..=INVOICE_ID_ATTEMPTS {
            payment.invoice_id = generate_invoice_id();
            self.state_machine.validate(&payment)?;

            match self.payments.create(payment.clone()).await {
                Ok(created) => {
                    tracing::info!(
                        payment_id = %created.id,
                        invoice_id = %created.invoice_id,
                        amount = created.amount,
                        currency = %created.currency,
                        "Created pending payment"
                    );
                    return Ok(created);
                }
                Err(AppError::Conflict(_)) if attempt < INVOICE_ID_ATTEMPTS => {
                    tracing::debug!(invoice_id = %payment.invoice_id, "Invoice id collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal("Could not allocate a unique invoice id".to_string()))
    }

    pub async fn initiate_payment(&self, request: CreatePaymentRequest) -> Result<CheckoutSession> {
        let payment = self.create_pending_payment(request).await?;

        // If this fails the payment stays pending and the expiry sweep ends it.
        let token = self.gateway.checkout_token(&payment).await.map_err(|e| {
            tracing::warn!(payment_id = %payment.id, "Failed to obtain checkout token: {}", e);
            e
        })?;

        Ok(CheckoutSession {
            payment,
            access_token: token.token,
            terminal_id: self.gateway_config.terminal_id.clone(),
            post_link: self.gateway_config.post_link.clone(),
            failure_post_link: self.gateway_config.failure_post_link.clone(),
        })
    }

    /// Webhook entry point. `raw` is the request body exactly as received so
    /// that a retry replays the same bytes.
    pub async fn process_callback(&self, raw: &str) -> Result<CallbackAck> {
        let callback: PaymentCallback = serde_json::from_str(raw)
            .map_err(|e| AppError::BadRequest(format!("Malformed callback payload: {}", e)))?;
        if callback.invoice_id.trim().is_empty() {
            return Err(AppError::BadRequest("Callback has no invoice id".to_string()));
        }

        match self.processor.handle(&callback.invoice_id, &callback).await {
            Ok(outcome) => Ok(CallbackAck {
                payment_id: Some(outcome.payment_id),
                status: Some(outcome.status),
                message: if outcome.applied {
                    "Callback processed".to_string()
                } else {
                    "Callback already applied".to_string()
                },
            }),
            Err(e) if e.is_retryable() => {
                let payment = self
                    .payments
                    .find_by_invoice_id(&callback.invoice_id)
                    .await
                    .ok()
                    .flatten();
                let payment_id = payment.as_ref().map(|p| p.id);

                // If this write fails too the error goes back to the provider,
                // which redelivers.
                self.ledger
                    .record_failure(&callback.invoice_id, payment_id, raw, &e.to_string())
                    .await?;

                Ok(CallbackAck {
                    payment_id,
                    status: payment.map(|p| p.status),
                    message: "Callback accepted, processing deferred".to_string(),
                })
            }
            Err(AppError::Validation(reason)) => {
                // The payload contradicts recorded history. Redelivery cannot
                // fix that, so acknowledge with what we have.
                let payment = self
                    .payments
                    .find_by_invoice_id(&callback.invoice_id)
                    .await?;
                Ok(CallbackAck {
                    payment_id: payment.as_ref().map(|p| p.id),
                    status: payment.map(|p| p.status),
                    message: format!("Callback rejected: {}", reason),
                })
            }
            Err(AppError::NotFound(_)) => {
                // Already logged. Redelivering will not create the payment,
                // so the provider gets its acknowledgement.
                Ok(CallbackAck {
                    payment_id: None,
                    status: None,
                    message: "Unknown invoice".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_payment(&self, id: Uuid) -> Result<Payment> {
        let mut payment = self.get_payment(id).await?;
        self.state_machine
            .validate_status_transition(payment.status, PaymentStatus::Cancelled)?;

        if payment.status == PaymentStatus::Processing {
            // The provider may hold an authorization we cannot name; cancelling
            // only locally would hide it.
            let txn = payment.gateway_transaction_id.as_deref().ok_or_else(|| {
                AppError::Validation(
                    "processing payment has no gateway transaction; verify it before cancelling"
                        .to_string(),
                )
            })?;
            self.gateway.cancel(txn).await?;
        }

        let previous = payment.status;
        payment.status = PaymentStatus::Cancelled;
        payment.updated_at = self.clock.now();
        let saved = self.payments.update(&payment, previous).await?;

        tracing::info!(payment_id = %saved.id, from = %previous, "Payment cancelled");
        Ok(saved)
    }

    /// Full refund when `amount` is `None`. A partial refund still moves the
    /// payment to `refunded`.
    pub async fn refund_payment(&self, id: Uuid, amount: Option<i64>) -> Result<Payment> {
        let mut payment = self.get_payment(id).await?;
        self.state_machine.can_refund(&payment, self.policy.refund_window())?;
        self.state_machine
            .validate_status_transition(payment.status, PaymentStatus::Refunded)?;

        if let Some(requested) = amount {
            if requested < 1 || requested > payment.amount {
                return Err(AppError::Validation(format!(
                    "refund amount must be between 1 and {}, got {}",
                    payment.amount, requested
                )));
            }
        }

        let txn = payment.gateway_transaction_id.clone().ok_or_else(|| {
            AppError::Validation("payment has no gateway transaction to refund".to_string())
        })?;
        let external_id = payment.id.to_string();
        self.gateway.refund(&txn, amount, Some(&external_id)).await?;

        let previous = payment.status;
        payment.status = PaymentStatus::Refunded;
        payment.updated_at = self.clock.now();
        let saved = self.payments.update(&payment, previous).await?;

        tracing::info!(
            payment_id = %saved.id,
            amount = amount.unwrap_or(saved.amount),
            "Payment refunded"
        );
        Ok(saved)
    }

    /// Asks the provider for the transaction's state and applies it the same
    /// way a callback would be applied.
    pub async fn verify_payment(&self, id: Uuid) -> Result<Payment> {
        let payment = self.get_payment(id).await?;
        let snapshot = self.gateway.check_status(&payment.invoice_id).await?;
        let new_status = self.state_machine.map_gateway_status(&snapshot.status);

        tracing::debug!(
            payment_id = %payment.id,
            provider_status = %snapshot.status,
            mapped = %new_status,
            "Reconciling payment with gateway"
        );

        self.processor
            .reconcile(payment, new_status, &snapshot.to_update())
            .await?;
        self.get_payment(id).await
    }

    pub async fn charge_saved_card(&self, id: Uuid, card_id: &str) -> Result<Payment> {
        let mut payment = self.get_payment(id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::Validation(format!(
                "only pending payments can be charged (payment is {})",
                payment.status
            )));
        }
        self.state_machine
            .validate_status_transition(payment.status, PaymentStatus::Processing)?;

        payment.status = PaymentStatus::Processing;
        payment.payment_method = PaymentMethod::SavedCard;
        payment.updated_at = self.clock.now();
        let payment = self.payments.update(&payment, PaymentStatus::Pending).await?;

        let request = SavedCardCharge {
            invoice_id: payment.invoice_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            description: payment.description.clone(),
            account_id: payment.member_id.to_string(),
            card_id: card_id.to_string(),
        };

        let (new_status, update) = match self.gateway.charge_saved_card(&request).await {
            Ok(charge) => (
                self.state_machine.map_gateway_status(&charge.status),
                charge.to_update(),
            ),
            Err(e) if e.is_retryable() => {
                // Outcome unknown. Leave it processing for the callback,
                // a verify call or the expiry sweep to settle.
                tracing::warn!(
                    payment_id = %payment.id,
                    "Saved card charge outcome unknown: {}",
                    e
                );
                return Err(e.into());
            }
            Err(e) => {
                let (code, message) = match &e {
                    GatewayError::Rejected { code, message, .. } => {
                        (code.clone(), message.clone())
                    }
                    other => ("invalid_response".to_string(), other.to_string()),
                };
                let update = GatewayUpdate {
                    error_code: Some(code),
                    error_message: Some(message),
                    ..Default::default()
                };
                (PaymentStatus::Failed, update)
            }
        };

        self.processor.reconcile(payment, new_status, &update).await?;
        self.get_payment(id).await
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment> {
        self.payments
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))
    }

    pub async fn list_member_payments(&self, member_id: Uuid) -> Result<Vec<Payment>> {
        self.payments.find_by_member(member_id).await
    }
}

/// Twelve digits, zero padded; the provider accepts 6 to 15.
fn generate_invoice_id() -> String {
    let n: u64 = rand::thread_rng().gen_range(0..1_000_000_000_000);
    format!("{:012}", n)
}
