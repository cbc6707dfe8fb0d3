use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{CallbackRetry, CallbackRetryStatus},
    error::{AppError, Result},
    repository::CallbackRetryRepository,
};

#[derive(FromRow)]
struct CallbackRetryRow {
    id: String,
    payment_id: Option<String>,
    invoice_id: String,
    callback_data: String,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    next_retry_at: Option<NaiveDateTime>,
    status: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

pub struct SqliteCallbackRetryRepository {
    pool: SqlitePool,
}

impl SqliteCallbackRetryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: CallbackRetryRow) -> Result<CallbackRetry> {
        let payment_id = row
            .payment_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(CallbackRetry {
            id: Uuid::parse_str(&row.id).map_err(|e| AppError::Database(e.to_string()))?,
            payment_id,
            invoice_id: row.invoice_id,
            callback_data: row.callback_data,
            retry_count: row.retry_count as i32,
            max_retries: row.max_retries as i32,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            status: CallbackRetryStatus::from_str(&row.status)
                .ok_or_else(|| AppError::Database(format!("Invalid callback retry status: {}", row.status)))?,
            created_at: DateTime::from_naive_utc_and_offset(row.created_at, Utc),
            updated_at: DateTime::from_naive_utc_and_offset(row.updated_at, Utc),
        })
    }
}

#[async_trait]
impl CallbackRetryRepository for SqliteCallbackRetryRepository {
    async fn create(&self, entry: CallbackRetry) -> Result<CallbackRetry> {
        sqlx::query(
            r#"
            INSERT INTO callback_retries (
                id, payment_id, invoice_id, callback_data, retry_count,
                max_retries, last_error, next_retry_at, status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(entry.id.to_string())
        .bind(entry.payment_id.map(|id| id.to_string()))
        .bind(&entry.invoice_id)
        .bind(&entry.callback_data)
        .bind(entry.retry_count as i64)
        .bind(entry.max_retries as i64)
        .bind(&entry.last_error)
        .bind(entry.next_retry_at.map(|dt| dt.naive_utc()))
        .bind(entry.status.as_str())
        .bind(entry.created_at.naive_utc())
        .bind(entry.updated_at.naive_utc())
        .execute(&self.pool)
        .await?;

        self.find_by_id(entry.id).await?.ok_or_else(|| {
            AppError::Database("Failed to retrieve created callback retry".to_string())
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<CallbackRetry>> {
        let row = sqlx::query_as::<_, CallbackRetryRow>(
            r#"
            SELECT id, payment_id, invoice_id, callback_data, retry_count,
                   max_retries, last_error, next_retry_at, status,
                   created_at, updated_at
            FROM callback_retries
            WHERE id = ?
            "#
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn find_active_by_invoice(&self, invoice_id: &str) -> Result<Option<CallbackRetry>> {
        let row = sqlx::query_as::<_, CallbackRetryRow>(
            r#"
            SELECT id, payment_id, invoice_id, callback_data, retry_count,
                   max_retries, last_error, next_retry_at, status,
                   created_at, updated_at
            FROM callback_retries
            WHERE invoice_id = ? AND status IN ('pending', 'processing')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn list_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<CallbackRetry>> {
        let rows = sqlx::query_as::<_, CallbackRetryRow>(
            r#"
            SELECT id, payment_id, invoice_id, callback_data, retry_count,
                   max_retries, last_error, next_retry_at, status,
                   created_at, updated_at
            FROM callback_retries
            WHERE status = 'pending'
              AND retry_count < max_retries
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#
        )
        .bind(now.naive_utc())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(Self::row_to_entry)
            .collect()
    }

    async fn update(&self, entry: &CallbackRetry) -> Result<CallbackRetry> {
        let result = sqlx::query(
            r#"
            UPDATE callback_retries
            SET payment_id = ?,
                callback_data = ?,
                retry_count = ?,
                max_retries = ?,
                last_error = ?,
                next_retry_at = ?,
                status = ?,
                updated_at = ?
            WHERE id = ?
            "#
        )
        .bind(entry.payment_id.map(|id| id.to_string()))
        .bind(&entry.callback_data)
        .bind(entry.retry_count as i64)
        .bind(entry.max_retries as i64)
        .bind(&entry.last_error)
        .bind(entry.next_retry_at.map(|dt| dt.naive_utc()))
        .bind(entry.status.as_str())
        .bind(entry.updated_at.naive_utc())
        .bind(entry.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Callback retry {} not found", entry.id)));
        }

        self.find_by_id(entry.id).await?.ok_or_else(|| {
            AppError::Database("Failed to retrieve updated callback retry".to_string())
        })
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM callback_retries WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release_stale_processing(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE callback_retries
            SET status = 'pending', updated_at = ?
            WHERE status = 'processing' AND updated_at < ?
            "#
        )
        .bind(now.naive_utc())
        .bind(before.naive_utc())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
