use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{Payment, PaymentMethod, PaymentStatus, PaymentType},
    error::{AppError, Result},
    repository::PaymentRepository,
};

const PAYMENT_COLUMNS: &str = r#"
    id, member_id, invoice_id, amount, currency, payment_type,
    payment_method, status, description, gateway_transaction_id,
    card_mask, approval_code, error_code, error_message,
    gateway_response, created_at, updated_at, completed_at, expires_at
"#;

#[derive(FromRow)]
struct PaymentRow {
    id: String,
    member_id: String,
    invoice_id: String,
    amount: i64,
    currency: String,
    payment_type: String,
    payment_method: String,
    status: String,
    description: String,
    gateway_transaction_id: Option<String>,
    card_mask: Option<String>,
    approval_code: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    gateway_response: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    completed_at: Option<NaiveDateTime>,
    expires_at: NaiveDateTime,
}

pub struct SqlitePaymentRepository {
    pool: SqlitePool,
}

impl SqlitePaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: PaymentRow) -> Result<Payment> {
        Ok(Payment {
            id: Uuid::parse_str(&row.id).map_err(|e| AppError::Database(e.to_string()))?,
            member_id: Uuid::parse_str(&row.member_id).map_err(|e| AppError::Database(e.to_string()))?,
            invoice_id: row.invoice_id,
            amount: row.amount,
            currency: row.currency,
            payment_type: PaymentType::from_str(&row.payment_type)
                .ok_or_else(|| AppError::Database(format!("Invalid payment type: {}", row.payment_type)))?,
            payment_method: PaymentMethod::from_str(&row.payment_method)
                .ok_or_else(|| AppError::Database(format!("Invalid payment method: {}", row.payment_method)))?,
            status: PaymentStatus::from_str(&row.status)
                .ok_or_else(|| AppError::Database(format!("Invalid payment status: {}", row.status)))?,
            description: row.description,
            gateway_transaction_id: row.gateway_transaction_id,
            card_mask: row.card_mask,
            approval_code: row.approval_code,
            error_code: row.error_code,
            error_message: row.error_message,
            gateway_response: row.gateway_response,
            created_at: DateTime::from_naive_utc_and_offset(row.created_at, Utc),
            updated_at: DateTime::from_naive_utc_and_offset(row.updated_at, Utc),
            completed_at: row.completed_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            expires_at: DateTime::from_naive_utc_and_offset(row.expires_at, Utc),
        })
    }

    fn map_unique_violation(err: sqlx::Error, invoice_id: &str) -> AppError {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(format!("Invoice {} already exists", invoice_id))
            }
            _ => AppError::Database(err.to_string()),
        }
    }
}

#[async_trait]
impl PaymentRepository for SqlitePaymentRepository {
    async fn create(&self, payment: Payment) -> Result<Payment> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, member_id, invoice_id, amount, currency, payment_type,
                payment_method, status, description, gateway_transaction_id,
                card_mask, approval_code, error_code, error_message,
                gateway_response, created_at, updated_at, completed_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(payment.id.to_string())
        .bind(payment.member_id.to_string())
        .bind(&payment.invoice_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.payment_type.as_str())
        .bind(payment.payment_method.as_str())
        .bind(payment.status.as_str())
        .bind(&payment.description)
        .bind(&payment.gateway_transaction_id)
        .bind(&payment.card_mask)
        .bind(&payment.approval_code)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(&payment.gateway_response)
        .bind(payment.created_at.naive_utc())
        .bind(payment.updated_at.naive_utc())
        .bind(payment.completed_at.map(|dt| dt.naive_utc()))
        .bind(payment.expires_at.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_unique_violation(e, &payment.invoice_id))?;

        self.find_by_id(payment.id).await?.ok_or_else(|| {
            AppError::Database("Failed to retrieve created payment".to_string())
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(
            &format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLUMNS)
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn find_by_invoice_id(&self, invoice_id: &str) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(
            &format!("SELECT {} FROM payments WHERE invoice_id = ?", PAYMENT_COLUMNS)
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn find_by_member(&self, member_id: Uuid) -> Result<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            &format!(
                "SELECT {} FROM payments WHERE member_id = ? ORDER BY created_at DESC",
                PAYMENT_COLUMNS
            )
        )
        .bind(member_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(Self::row_to_payment)
            .collect()
    }

    async fn update(&self, payment: &Payment, expected_status: PaymentStatus) -> Result<Payment> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = ?,
                payment_method = ?,
                gateway_transaction_id = ?,
                card_mask = ?,
                approval_code = ?,
                error_code = ?,
                error_message = ?,
                gateway_response = ?,
                updated_at = ?,
                completed_at = ?
            WHERE id = ? AND status = ?
            "#
        )
        .bind(payment.status.as_str())
        .bind(payment.payment_method.as_str())
        .bind(&payment.gateway_transaction_id)
        .bind(&payment.card_mask)
        .bind(&payment.approval_code)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(&payment.gateway_response)
        .bind(payment.updated_at.naive_utc())
        .bind(payment.completed_at.map(|dt| dt.naive_utc()))
        .bind(payment.id.to_string())
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(payment.id).await? {
                Some(current) => Err(AppError::Conflict(format!(
                    "Payment {} is {} (expected {})",
                    payment.id, current.status, expected_status
                ))),
                None => Err(AppError::NotFound(format!("Payment {} not found", payment.id))),
            };
        }

        self.find_by_id(payment.id).await?.ok_or_else(|| {
            AppError::Database("Failed to retrieve updated payment".to_string())
        })
    }

    async fn list_expired(
        &self,
        statuses: &[PaymentStatus],
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            format!("SELECT {} FROM payments WHERE status IN (", PAYMENT_COLUMNS)
        );
        let mut separated = query.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        query.push(") AND expires_at <= ");
        query.push_bind(now.naive_utc());
        query.push(" ORDER BY expires_at ASC LIMIT ");
        query.push_bind(limit);

        let rows = query
            .build_query_as::<PaymentRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(Self::row_to_payment)
            .collect()
    }
}
