//! Postgres-backed ledger.
//!
//! Expected tables:
//!
//! ```sql
//! CREATE TABLE transactions (
//!     id                UUID PRIMARY KEY,
//!     job_id            UUID NOT NULL,
//!     transaction_type  TEXT NOT NULL,
//!     status            TEXT NOT NULL,
//!     gateway_intent_id TEXT,
//!     gateway_charge_id TEXT,
//!     gateway_refund_id TEXT,
//!     revision          BIGINT NOT NULL,
//!     record            JSONB NOT NULL,
//!     created_at        TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX ON transactions (job_id);
//!
//! CREATE TABLE payment_events (
//!     id              UUID PRIMARY KEY,
//!     transaction_id  UUID NOT NULL REFERENCES transactions (id),
//!     job_id          UUID NOT NULL,
//!     idempotency_key TEXT NOT NULL,
//!     attempt         INT NOT NULL,
//!     outcome         TEXT NOT NULL,
//!     event           JSONB NOT NULL,
//!     recorded_at     TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX ON payment_events (idempotency_key, attempt);
//! ```
//!
//! The full record/event is stored as JSONB; the indexed columns exist for lookups.

use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use jobflow_core::{JobId, TransactionId};
use jobflow_escrow::{PaymentEvent, PaymentOutcome, TransactionRecord};

use super::{LedgerBatch, LedgerError, LedgerStore};
use crate::event_store::postgres::block_on;

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(
        skip(self, batch),
        fields(records = batch.records.len(), events = batch.events.len()),
        err
    )]
    pub async fn commit_async(
        &self,
        batch: LedgerBatch,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut written = Vec::with_capacity(batch.records.len());
        for mut record in batch.records {
            let expected = record.revision;
            record.revision += 1;
            write_record(&mut tx, &record, expected).await?;
            written.push(record);
        }

        for event in &batch.events {
            insert_event(&mut tx, event).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(written)
    }

    async fn fetch_records(
        &self,
        sql: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let rows = bind(sqlx::query(sql))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_records", e))?;
        rows.iter().map(|row| decode(row, "record")).collect()
    }

    async fn fetch_events(
        &self,
        sql: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<PaymentEvent>, LedgerError> {
        let rows = bind(sqlx::query(sql))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_events", e))?;
        rows.iter().map(|row| decode(row, "event")).collect()
    }
}

async fn write_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &TransactionRecord,
    expected_revision: u64,
) -> Result<(), LedgerError> {
    let json = serde_json::to_value(record)
        .map_err(|e| LedgerError::Storage(format!("record serialization failed: {e}")))?;

    let result = if expected_revision == 0 {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, job_id, transaction_type, status,
                gateway_intent_id, gateway_charge_id, gateway_refund_id,
                revision, record, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.job_id.as_uuid())
        .bind(record.transaction_type.as_str())
        .bind(record.status.as_str())
        .bind(record.gateway.intent_id.as_deref())
        .bind(record.gateway.charge_id.as_deref())
        .bind(record.gateway.refund_id.as_deref())
        .bind(record.revision as i64)
        .bind(&json)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await
    } else {
        sqlx::query(
            r#"
            UPDATE transactions SET
                status = $2,
                gateway_intent_id = $3,
                gateway_charge_id = $4,
                gateway_refund_id = $5,
                revision = $6,
                record = $7
            WHERE id = $1 AND revision = $8
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.gateway.intent_id.as_deref())
        .bind(record.gateway.charge_id.as_deref())
        .bind(record.gateway.refund_id.as_deref())
        .bind(record.revision as i64)
        .bind(&json)
        .bind(expected_revision as i64)
        .execute(&mut **tx)
        .await
    };

    let done = result.map_err(|e| map_sqlx_error("write_record", e))?;
    if done.rows_affected() != 1 {
        return Err(LedgerError::Conflict(format!(
            "transaction {} is no longer at revision {expected_revision}",
            record.id
        )));
    }
    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &PaymentEvent,
) -> Result<(), LedgerError> {
    let json = serde_json::to_value(event)
        .map_err(|e| LedgerError::Storage(format!("event serialization failed: {e}")))?;
    let outcome = match event.outcome {
        PaymentOutcome::Attempted => "attempted",
        PaymentOutcome::Succeeded => "succeeded",
        PaymentOutcome::Failed => "failed",
        PaymentOutcome::Ambiguous => "ambiguous",
    };

    sqlx::query(
        r#"
        INSERT INTO payment_events (
            id, transaction_id, job_id, idempotency_key, attempt, outcome, event, recorded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.id)
    .bind(event.transaction_id.as_uuid())
    .bind(event.job_id.as_uuid())
    .bind(&event.idempotency_key)
    .bind(event.attempt as i32)
    .bind(outcome)
    .bind(&json)
    .bind(event.recorded_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_event", e))?;
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(
    row: &sqlx::postgres::PgRow,
    column: &str,
) -> Result<T, LedgerError> {
    let value: serde_json::Value = row
        .try_get(column)
        .map_err(|e| LedgerError::Storage(format!("failed to read {column}: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| LedgerError::Storage(format!("failed to decode {column}: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::Conflict(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        other => LedgerError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

impl LedgerStore for PostgresLedger {
    fn commit(&self, batch: LedgerBatch) -> Result<Vec<TransactionRecord>, LedgerError> {
        block_on(self.commit_async(batch), LedgerError::Storage)
    }

    fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, LedgerError> {
        let found = block_on(
            self.fetch_records("SELECT record FROM transactions WHERE id = $1", |q| {
                q.bind(*id.as_uuid())
            }),
            LedgerError::Storage,
        )?;
        Ok(found.into_iter().next())
    }

    fn by_job(&self, job_id: JobId) -> Result<Vec<TransactionRecord>, LedgerError> {
        block_on(
            self.fetch_records(
                "SELECT record FROM transactions WHERE job_id = $1 ORDER BY created_at, id",
                |q| q.bind(*job_id.as_uuid()),
            ),
            LedgerError::Storage,
        )
    }

    fn by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let reference = reference.to_string();
        block_on(
            self.fetch_records(
                r#"
                SELECT record FROM transactions
                WHERE gateway_intent_id = $1 OR gateway_charge_id = $1 OR gateway_refund_id = $1
                ORDER BY created_at, id
                "#,
                |q| q.bind(reference),
            ),
            LedgerError::Storage,
        )
    }

    fn events_for_transaction(&self, id: TransactionId) -> Result<Vec<PaymentEvent>, LedgerError> {
        block_on(
            self.fetch_events(
                "SELECT event FROM payment_events WHERE transaction_id = $1 ORDER BY recorded_at, id",
                |q| q.bind(*id.as_uuid()),
            ),
            LedgerError::Storage,
        )
    }

    fn events_for_job(&self, job_id: JobId) -> Result<Vec<PaymentEvent>, LedgerError> {
        block_on(
            self.fetch_events(
                "SELECT event FROM payment_events WHERE job_id = $1 ORDER BY recorded_at, id",
                |q| q.bind(*job_id.as_uuid()),
            ),
            LedgerError::Storage,
        )
    }

    fn unresolved_attempts(&self) -> Result<Vec<PaymentEvent>, LedgerError> {
        block_on(
            self.fetch_events(
                r#"
                SELECT a.event FROM payment_events a
                WHERE a.outcome = 'attempted'
                  AND NOT EXISTS (
                      SELECT 1 FROM payment_events r
                      WHERE r.idempotency_key = a.idempotency_key
                        AND r.attempt >= a.attempt
                        AND r.outcome IN ('succeeded', 'failed')
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM payment_events l
                      WHERE l.idempotency_key = a.idempotency_key
                        AND l.attempt > a.attempt
                        AND l.outcome = 'attempted'
                  )
                ORDER BY a.recorded_at, a.id
                "#,
                |q| q,
            ),
            LedgerError::Storage,
        )
    }
}
