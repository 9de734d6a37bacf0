//! Execution streams in Postgres.
//!
//! ```sql
//! CREATE TABLE job_events (
//!     event_id        UUID PRIMARY KEY,
//!     aggregate_id    UUID NOT NULL,
//!     aggregate_type  TEXT NOT NULL,
//!     sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
//!     event_type      TEXT NOT NULL,
//!     event_version   INT NOT NULL,
//!     occurred_at     TIMESTAMPTZ NOT NULL,
//!     payload         JSONB NOT NULL,
//!     UNIQUE (aggregate_id, sequence_number)
//! );
//! ```
//!
//! Unique violations (`23505`) map to `Concurrency`, check violations (`23514`) to
//! `InvalidAppend`, anything else to `Storage`.

use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use jobflow_core::{AggregateId, ExpectedVersion};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, UncommittedEvent, batch_target, check_head,
};

const SELECT_STREAM: &str = "SELECT event_id, aggregate_id, aggregate_type, sequence_number, \
     event_type, event_version, occurred_at, payload \
     FROM job_events WHERE aggregate_id = $1 ORDER BY sequence_number";

const STREAM_HEAD: &str = "SELECT sequence_number, aggregate_type FROM job_events \
     WHERE aggregate_id = $1 ORDER BY sequence_number DESC LIMIT 1";

const INSERT_EVENT: &str = "INSERT INTO job_events (event_id, aggregate_id, aggregate_type, \
     sequence_number, event_type, event_version, occurred_at, payload) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const STREAMS_OF_TYPE: &str = "SELECT aggregate_id FROM job_events \
     WHERE aggregate_type = $1 AND sequence_number = 1 ORDER BY occurred_at, event_id";

/// Postgres event store.
///
/// An append reads the stream head and inserts inside one transaction. Two writers that
/// read the same head both try to insert the same `(aggregate_id, sequence_number)`;
/// the loser hits the unique constraint and gets `Concurrency`.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), fields(job_id = %aggregate_id, events = tracing::field::Empty), err)]
    pub async fn load_stream_async(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(SELECT_STREAM)
            .bind(aggregate_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage_error("load stream", e))?;
        let stream = rows
            .iter()
            .map(decode_event)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EventStoreError::Storage(format!("undecodable event row: {e}")))?;
        Span::current().record("events", stream.len());
        Ok(stream)
    }

    #[instrument(
        skip(self, events),
        fields(job_id = tracing::field::Empty, events = events.len()),
        err
    )]
    pub async fn append_async(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some((aggregate_id, batch_type)) = batch_target(&events)? else {
            return Ok(Vec::new());
        };
        let batch_type = batch_type.to_owned();
        Span::current().record("job_id", tracing::field::display(aggregate_id));

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("begin", e))?;
        let (current, stream_type) = stream_head(&mut tx, aggregate_id).await?;
        // Dropping `tx` on the error path rolls it back.
        check_head(stream_type.as_deref(), &batch_type, current, expected_version)?;

        let mut committed = Vec::with_capacity(events.len());
        for (event, seq) in events.into_iter().zip(current + 1..) {
            let stored = event.at_position(seq);
            insert_event(&mut tx, &stored).await?;
            committed.push(stored);
        }
        tx.commit().await.map_err(|e| storage_error("commit", e))?;
        Ok(committed)
    }

    #[instrument(skip(self), err)]
    pub async fn list_streams_async(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(STREAMS_OF_TYPE)
            .bind(aggregate_type)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage_error("list streams", e))?;
        Ok(ids.into_iter().map(AggregateId::from_uuid).collect())
    }
}

/// Last sequence number and aggregate type of a stream; `(0, None)` when it is empty.
async fn stream_head(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let head: Option<(i64, String)> = sqlx::query_as(STREAM_HEAD)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| storage_error("read stream head", e))?;
    Ok(match head {
        Some((seq, aggregate_type)) => (seq as u64, Some(aggregate_type)),
        None => (0, None),
    })
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &StoredEvent,
) -> Result<(), EventStoreError> {
    sqlx::query(INSERT_EVENT)
        .bind(event.event_id)
        .bind(event.aggregate_id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(event.sequence_number as i64)
        .bind(&event.event_type)
        .bind(event.event_version as i32)
        .bind(event.occurred_at)
        .bind(&event.payload)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_error("insert event", e))?;
    Ok(())
}

fn decode_event(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        event_id: row.try_get("event_id")?,
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id")?),
        aggregate_type: row.try_get("aggregate_type")?,
        sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
        event_type: row.try_get("event_type")?,
        event_version: row.try_get::<i32, _>("event_version")? as u32,
        occurred_at: row.try_get("occurred_at")?,
        payload: row.try_get("payload")?,
    })
}

fn storage_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    let sqlx::Error::Database(db) = &err else {
        return EventStoreError::Storage(format!("{operation}: {err}"));
    };
    let message = format!("{operation}: {}", db.message());
    match db.code().as_deref() {
        Some("23505") => EventStoreError::Concurrency(message),
        Some("23514") => EventStoreError::InvalidAppend(message),
        _ => EventStoreError::Storage(message),
    }
}

/// Drive a store future to completion from synchronous code.
///
/// The caller must be inside a multi-threaded tokio runtime and must not itself be
/// running on an async task.
pub(crate) fn block_on<F, T, E>(future: F, unavailable: impl FnOnce(String) -> E) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(future),
        Err(e) => Err(unavailable(format!("no tokio runtime entered: {e}"))),
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on(self.append_async(events, expected_version), EventStoreError::Storage)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on(self.load_stream_async(aggregate_id), EventStoreError::Storage)
    }

    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        block_on(self.list_streams_async(aggregate_type), EventStoreError::Storage)
    }
}
