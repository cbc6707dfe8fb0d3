use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use validator::Validate;

use crate::{
    api::state::AppState,
    domain::{CallbackAck, CreatePaymentRequest, Payment, PaymentMethod, PaymentStatus, PaymentType},
    error::{AppError, Result},
};

pub const SIGNATURE_HEADER: &str = "x-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
pub struct PaymentDto {
    id: Uuid,
    member_id: Uuid,
    invoice_id: String,
    amount: i64,
    currency: String,
    payment_type: PaymentType,
    payment_method: PaymentMethod,
    status: PaymentStatus,
    description: String,
    card_mask: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    expires_at: String,
}

impl From<Payment> for PaymentDto {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            member_id: payment.member_id,
            invoice_id: payment.invoice_id,
            amount: payment.amount,
            currency: payment.currency,
            payment_type: payment.payment_type,
            payment_method: payment.payment_method,
            status: payment.status,
            description: payment.description,
            card_mask: payment.card_mask,
            error_code: payment.error_code,
            error_message: payment.error_message,
            created_at: payment.created_at.to_rfc3339(),
            completed_at: payment.completed_at.map(|dt| dt.to_rfc3339()),
            expires_at: payment.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    payment: PaymentDto,
    access_token: String,
    terminal_id: String,
    post_link: String,
    failure_post_link: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    /// Partial refund amount; the full amount when omitted.
    #[validate(range(min = 1))]
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChargeRequest {
    #[validate(length(min = 1, max = 128))]
    pub card_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>)> {
    let session = state.service_context.payment_service
        .initiate_payment(request)
        .await?;

    Ok((StatusCode::CREATED, Json(CheckoutResponse {
        payment: session.payment.into(),
        access_token: session.access_token,
        terminal_id: session.terminal_id,
        post_link: session.post_link,
        failure_post_link: session.failure_post_link,
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentDto>> {
    let payment = state.service_context.payment_service.get_payment(id).await?;
    Ok(Json(payment.into()))
}

pub async fn list_by_member(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentDto>>> {
    let payments = state.service_context.payment_service
        .list_member_payments(member_id)
        .await?;
    Ok(Json(payments.into_iter().map(Into::into).collect()))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentDto>> {
    let payment = state.service_context.payment_service.cancel_payment(id).await?;
    Ok(Json(payment.into()))
}

pub async fn refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RefundRequest>>,
) -> Result<Json<PaymentDto>> {
    let amount = match body {
        Some(Json(request)) => {
            request.validate().map_err(|e| AppError::Validation(e.to_string()))?;
            request.amount
        }
        None => None,
    };

    let payment = state.service_context.payment_service
        .refund_payment(id, amount)
        .await?;
    Ok(Json(payment.into()))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentDto>> {
    let payment = state.service_context.payment_service.verify_payment(id).await?;
    Ok(Json(payment.into()))
}

pub async fn charge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ChargeRequest>,
) -> Result<Json<PaymentDto>> {
    request.validate().map_err(|e| AppError::Validation(e.to_string()))?;

    let payment = state.service_context.payment_service
        .charge_saved_card(id, &request.card_id)
        .await?;
    Ok(Json(payment.into()))
}

/// Provider webhook. Takes the raw body so the signature is checked over the
/// exact bytes sent and the same bytes can be queued for retry.
pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackAck>> {
    let secret = state.settings.gateway.webhook_secret
        .as_deref()
        .filter(|s| !s.is_empty());

    if let Some(secret) = secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing callback signature".to_string()))?;

        if !verify_signature(secret, &body, signature) {
            tracing::warn!("Rejected callback with invalid signature");
            return Err(AppError::Unauthorized("Invalid callback signature".to_string()));
        }
    }

    let raw = std::str::from_utf8(&body)
        .map_err(|_| AppError::BadRequest("Callback body is not valid UTF-8".to_string()))?;

    let ack = state.service_context.payment_service
        .process_callback(raw)
        .await?;
    Ok(Json(ack))
}

/// Checks a hex HMAC-SHA256 of `body`. The comparison is constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
