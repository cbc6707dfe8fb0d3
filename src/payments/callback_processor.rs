use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    domain::{GatewayUpdate, Payment, PaymentCallback, PaymentStatus},
    error::{AppError, Result},
    payments::PaymentStateMachine,
    repository::PaymentRepository,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackOutcome {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    /// False when the delivery was a replay and nothing was written.
    pub applied: bool,
}

/// Applies one provider notification to the payment it names.
///
/// Errors are either permanent (`NotFound`, `Validation`) or retryable
/// (`Database`, `Conflict`); see [`AppError::is_retryable`]. Recording retries
/// is the caller's job.
pub struct CallbackProcessor {
    payments: Arc<dyn PaymentRepository>,
    state_machine: PaymentStateMachine,
}

impl CallbackProcessor {
    pub fn new(payments: Arc<dyn PaymentRepository>, state_machine: PaymentStateMachine) -> Self {
        Self { payments, state_machine }
    }

    pub async fn handle(
        &self,
        invoice_id: &str,
        callback: &PaymentCallback,
    ) -> Result<CallbackOutcome> {
        let payment = self
            .payments
            .find_by_invoice_id(invoice_id)
            .await?
            .ok_or_else(|| {
                tracing::error!(invoice_id = %invoice_id, "Callback for unknown invoice");
                AppError::NotFound(format!("No payment for invoice {}", invoice_id))
            })?;

        if callback.amount != payment.amount {
            tracing::warn!(
                payment_id = %payment.id,
                expected = payment.amount,
                reported = callback.amount,
                "Callback amount differs from recorded amount"
            );
        }

        let new_status = self.state_machine.map_gateway_status(callback.gateway_status());
        self.apply(payment, new_status, &callback.to_update()).await
    }

    /// Moves `payment` to `new_status` unless it is already final or already
    /// there. Exactly one store write when something changes, none otherwise.
    pub async fn apply(
        &self,
        mut payment: Payment,
        new_status: PaymentStatus,
        update: &GatewayUpdate,
    ) -> Result<CallbackOutcome> {
        if self.state_machine.is_final_status(payment.status) || payment.status == new_status {
            tracing::debug!(
                payment_id = %payment.id,
                status = %payment.status,
                reported = %new_status,
                "Ignoring replayed gateway update"
            );
            return Ok(CallbackOutcome {
                payment_id: payment.id,
                status: payment.status,
                applied: false,
            });
        }

        self.validate_gateway_transition(payment.status, new_status)
            .map_err(|e| {
                tracing::error!(
                    payment_id = %payment.id,
                    from = %payment.status,
                    to = %new_status,
                    "Gateway update contradicts payment history"
                );
                e
            })?;

        let previous = payment.status;
        self.state_machine.update_from_callback(&mut payment, new_status, update);
        let saved = self.payments.update(&payment, previous).await?;

        tracing::info!(
            payment_id = %saved.id,
            from = %previous,
            to = %saved.status,
            "Payment status updated from gateway"
        );

        Ok(CallbackOutcome {
            payment_id: saved.id,
            status: saved.status,
            applied: true,
        })
    }

    /// Like [`Self::apply`], for answers the service asked the provider for
    /// (status checks, saved-card charges). When the status is unchanged but
    /// the answer names a transaction, card or approval code we have not
    /// recorded, those facts are written so later cancels and refunds can
    /// reach the provider. Webhooks go through `apply`, where replays never
    /// write.
    pub async fn reconcile(
        &self,
        mut payment: Payment,
        new_status: PaymentStatus,
        update: &GatewayUpdate,
    ) -> Result<CallbackOutcome> {
        let same_open_status = payment.status == new_status
            && !self.state_machine.is_final_status(payment.status);
        if !same_open_status || !has_new_facts(&payment, update) {
            return self.apply(payment, new_status, update).await;
        }

        let status = payment.status;
        self.state_machine.update_from_callback(&mut payment, status, update);
        let saved = self.payments.update(&payment, status).await?;

        tracing::info!(
            payment_id = %saved.id,
            status = %saved.status,
            transaction_id = ?saved.gateway_transaction_id,
            "Recorded gateway transaction details"
        );

        Ok(CallbackOutcome {
            payment_id: saved.id,
            status: saved.status,
            applied: true,
        })
    }

    /// The hosted payment page settles in one step, so the provider reports
    /// success for payments we never saw enter `processing`. That jump is
    /// accepted when both legs of pending → processing → completed are legal.
    fn validate_gateway_transition(&self, from: PaymentStatus, to: PaymentStatus) -> Result<()> {
        if from == PaymentStatus::Pending && to == PaymentStatus::Completed {
            self.state_machine.validate_status_transition(from, PaymentStatus::Processing)?;
            return self.state_machine.validate_status_transition(PaymentStatus::Processing, to);
        }
        self.state_machine.validate_status_transition(from, to)
    }
}

fn has_new_facts(payment: &Payment, update: &GatewayUpdate) -> bool {
    let differs = |reported: &Option<String>, stored: &Option<String>| {
        reported.is_some() && reported != stored
    };
    differs(&update.transaction_id, &payment.gateway_transaction_id)
        || differs(&update.card_mask, &payment.card_mask)
        || differs(&update.approval_code, &payment.approval_code)
}
