use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::PaymentStatus;

/// Webhook body the provider posts after the payer finishes (or abandons)
/// the payment page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCallback {
    /// `ok` or `error`.
    pub code: String,
    pub invoice_id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub card_mask: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub reason_code: Option<String>,
    #[serde(default, alias = "id")]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub approval_code: Option<String>,
    #[serde(default, alias = "terminal")]
    pub terminal_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl PaymentCallback {
    /// A delivery reports success only when both the result code and the
    /// reason say so. Anything else is a failed payment.
    pub fn is_successful(&self) -> bool {
        self.code.eq_ignore_ascii_case("ok") && self.reason.eq_ignore_ascii_case("success")
    }

    /// Status string in the provider's vocabulary, fed to the status mapper.
    pub fn gateway_status(&self) -> &'static str {
        if self.is_successful() {
            "success"
        } else {
            "failed"
        }
    }

    pub fn to_update(&self) -> GatewayUpdate {
        let (error_code, error_message) = if self.is_successful() {
            (None, None)
        } else {
            (
                self.reason_code.clone().or_else(|| Some(self.code.clone())),
                Some(self.reason.clone()).filter(|r| !r.is_empty()),
            )
        };

        GatewayUpdate {
            transaction_id: self.transaction_id.clone(),
            card_mask: self.card_mask.clone(),
            approval_code: self.approval_code.clone(),
            error_code,
            error_message,
            raw_response: serde_json::to_string(self).ok(),
        }
    }
}

/// The provider is inconsistent about quoting numeric codes.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Provider-reported facts to copy onto a payment alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayUpdate {
    pub transaction_id: Option<String>,
    pub card_mask: Option<String>,
    pub approval_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<String>,
}

/// Acknowledgement returned to the provider for every well-formed delivery.
/// `payment_id` and `status` are empty when the invoice is unknown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackAck {
    pub payment_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackRetry {
    pub id: Uuid,
    pub payment_id: Option<Uuid>,
    pub invoice_id: String,
    /// Raw webhook payload, replayed verbatim on each attempt.
    pub callback_data: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: CallbackRetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallbackRetryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CallbackRetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackRetryStatus::Pending => "pending",
            CallbackRetryStatus::Processing => "processing",
            CallbackRetryStatus::Completed => "completed",
            CallbackRetryStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CallbackRetryStatus::Pending),
            "processing" => Some(CallbackRetryStatus::Processing),
            "completed" => Some(CallbackRetryStatus::Completed),
            "failed" => Some(CallbackRetryStatus::Failed),
            _ => None,
        }
    }
}
