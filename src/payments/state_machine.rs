//! Payment lifecycle rules. Pure logic; no I/O.
//!
//! `cancelled` and `refunded` are terminal. `completed` may only move on to
//! `refunded`, and `failed` only back to `pending` for a retry from scratch.

use chrono::Duration;
use std::sync::Arc;

use crate::{
    clock::Clock,
    domain::{GatewayUpdate, Payment, PaymentStatus},
    error::{AppError, Result},
};

#[derive(Clone)]
pub struct PaymentStateMachine {
    clock: Arc<dyn Clock>,
}

impl PaymentStateMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn allowed_transitions(from: PaymentStatus) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match from {
            Pending => &[Processing, Cancelled, Failed],
            Processing => &[Completed, Failed, Cancelled],
            Completed => &[Refunded],
            Failed => &[Pending],
            Cancelled | Refunded => &[],
        }
    }

    pub fn validate(&self, payment: &Payment) -> Result<()> {
        if payment.member_id.is_nil() {
            return Err(AppError::Validation("member id is required".to_string()));
        }
        if payment.invoice_id.trim().is_empty() {
            return Err(AppError::Validation("invoice id is required".to_string()));
        }
        if payment.amount <= 0 {
            return Err(AppError::Validation(format!(
                "amount must be positive, got {}",
                payment.amount
            )));
        }
        if !is_iso_currency(&payment.currency) {
            return Err(AppError::Validation(format!(
                "currency must be an ISO 4217 code, got {:?}",
                payment.currency
            )));
        }
        if payment.expires_at <= payment.created_at {
            return Err(AppError::Validation(
                "expiry must be after creation time".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_status_transition(&self, from: PaymentStatus, to: PaymentStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(&to) {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "invalid status transition from {} to {}",
                from, to
            )))
        }
    }

    /// Maps a provider status to ours. Unknown values become `Failed`; an
    /// unrecognised status is never treated as money received.
    pub fn map_gateway_status(&self, raw: &str) -> PaymentStatus {
        match raw.trim().to_lowercase().as_str() {
            "success" | "completed" | "charge" | "charged" | "paid" => PaymentStatus::Completed,
            "auth" | "authorized" | "processing" | "in_progress" => PaymentStatus::Processing,
            "new" | "pending" | "created" => PaymentStatus::Pending,
            "cancel" | "cancelled" | "canceled" | "cancel_old" | "reverse" => PaymentStatus::Cancelled,
            "refund" | "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Failed,
        }
    }

    /// Statuses a later or duplicate callback must never overwrite.
    pub fn is_final_status(&self, status: PaymentStatus) -> bool {
        matches!(
            status,
            PaymentStatus::Completed | PaymentStatus::Refunded | PaymentStatus::Cancelled
        )
    }

    /// Copies provider facts onto the payment and moves it to `new_status`.
    /// The transition must already have been validated.
    pub fn update_from_callback(
        &self,
        payment: &mut Payment,
        new_status: PaymentStatus,
        update: &GatewayUpdate,
    ) {
        let now = self.clock.now();

        if let Some(id) = &update.transaction_id {
            payment.gateway_transaction_id = Some(id.clone());
        }
        if let Some(mask) = &update.card_mask {
            payment.card_mask = Some(mask.clone());
        }
        if let Some(code) = &update.approval_code {
            payment.approval_code = Some(code.clone());
        }
        payment.error_code = update.error_code.clone();
        payment.error_message = update.error_message.clone();
        if update.raw_response.is_some() {
            payment.gateway_response = update.raw_response.clone();
        }

        payment.status = new_status;
        payment.updated_at = now;
        if new_status == PaymentStatus::Completed {
            payment.completed_at = Some(now);
        }
    }

    pub fn can_refund(&self, payment: &Payment, window: Duration) -> Result<()> {
        if payment.status != PaymentStatus::Completed {
            return Err(AppError::Validation(format!(
                "only completed payments can be refunded (payment is {})",
                payment.status
            )));
        }
        let completed_at = payment.completed_at.ok_or_else(|| {
            AppError::Validation("payment has no completion time".to_string())
        })?;
        if self.clock.now() - completed_at > window {
            return Err(AppError::Validation(format!(
                "refund window of {} hours has elapsed",
                window.num_hours()
            )));
        }
        Ok(())
    }
}

fn is_iso_currency(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}
