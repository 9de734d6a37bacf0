use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use jobflow_core::{AggregateId, ExpectedVersion};
use jobflow_events::{Event, EventEnvelope};

/// A serialized step of an execution, waiting for its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

/// A persisted step. `sequence_number` starts at 1 per stream and has no gaps, so the
/// last one read is the version the next append must expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Serialize a typed domain event, keeping the name and schema version next to the
    /// payload so replays can pick the right decoder.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("cannot serialize {}: {e}", event.event_type()))
        })?;
        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_owned(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }

    pub(crate) fn at_position(self, sequence_number: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number,
            event_type: self.event_type,
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: self.payload,
        }
    }
}

impl StoredEvent {
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.as_str(),
            self.event_type.as_str(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer advanced the stream first.
    #[error("stream version conflict: {0}")]
    Concurrency(String),

    #[error("stream belongs to another aggregate type: {0}")]
    AggregateTypeMismatch(String),

    #[error("rejected append: {0}")]
    InvalidAppend(String),

    #[error("event storage unavailable: {0}")]
    Storage(String),

    #[error("committed but not published: {0}")]
    Publish(String),
}

/// Stream target of a batch, or `None` for an empty batch. Mixed batches are rejected.
pub(crate) fn batch_target(
    events: &[UncommittedEvent],
) -> Result<Option<(AggregateId, &str)>, EventStoreError> {
    let Some(head) = events.first() else {
        return Ok(None);
    };
    if let Some(pos) = events.iter().position(|e| e.aggregate_id != head.aggregate_id) {
        return Err(EventStoreError::InvalidAppend(format!(
            "event {pos} targets stream {}, batch started on {}",
            events[pos].aggregate_id, head.aggregate_id
        )));
    }
    if let Some(pos) = events.iter().position(|e| e.aggregate_type != head.aggregate_type) {
        return Err(EventStoreError::AggregateTypeMismatch(format!(
            "event {pos} is '{}', batch started as '{}'",
            events[pos].aggregate_type, head.aggregate_type
        )));
    }
    Ok(Some((head.aggregate_id, head.aggregate_type.as_str())))
}

/// The checks every backend runs against the stream head before writing.
pub(crate) fn check_head(
    stream_type: Option<&str>,
    batch_type: &str,
    current_version: u64,
    expected: ExpectedVersion,
) -> Result<(), EventStoreError> {
    if let Some(existing) = stream_type.filter(|t| *t != batch_type) {
        return Err(EventStoreError::AggregateTypeMismatch(format!(
            "stream is '{existing}', append was '{batch_type}'"
        )));
    }
    if !expected.matches(current_version) {
        return Err(EventStoreError::Concurrency(format!(
            "expected {expected:?}, stream is at {current_version}"
        )));
    }
    Ok(())
}

/// Append-only storage of execution streams, one stream per aggregate.
///
/// An append is all or nothing. It assigns `current + 1..` to the batch after checking
/// `expected_version` against the stream head. `load_stream` returns the stream in
/// sequence order and an empty vector for a stream that was never written.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Ids of every stream of the given aggregate type, oldest first.
    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError>;
}

impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        S::append(self, events, expected_version)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        S::load_stream(self, aggregate_id)
    }

    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        S::list_streams(self, aggregate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_owned(),
            event_type: "job.execution.submitted".to_owned(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn mixed_streams_in_one_batch_are_rejected() {
        let batch = vec![
            event(AggregateId::new(), "job.execution"),
            event(AggregateId::new(), "job.execution"),
        ];
        assert!(matches!(
            batch_target(&batch),
            Err(EventStoreError::InvalidAppend(_))
        ));
        assert!(batch_target(&[]).unwrap().is_none());
    }

    #[test]
    fn head_check_reports_type_before_version() {
        let err = check_head(Some("other"), "job.execution", 3, ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
        assert!(check_head(None, "job.execution", 0, ExpectedVersion::NoStream).is_ok());
    }
}
