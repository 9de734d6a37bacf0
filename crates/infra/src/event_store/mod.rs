//! Append-only event store boundary.
//!
//! Job executions persist every step here; the stream is the checkpoint an execution
//! resumes from.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Publish happens only after append succeeds.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: jobflow_events::EventBus<jobflow_events::EventEnvelope<serde_json::Value>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: jobflow_core::ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(events, expected_version)?;

        // At-least-once: the append is durable even if publication fails.
        for e in &committed {
            self.bus
                .publish(e.to_envelope())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        aggregate_id: jobflow_core::AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(aggregate_id)
    }

    fn list_streams(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<jobflow_core::AggregateId>, EventStoreError> {
        self.store.list_streams(aggregate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobflow_core::{AggregateId, ExpectedVersion};
    use jobflow_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn committed_events_are_published_in_order() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>> =
            Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus.clone());
        let id = AggregateId::new();

        let event = |n: u32| UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id: id,
            aggregate_type: "job.execution".into(),
            event_type: "job.execution.step".into(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "n": n }),
        };
        store
            .append(vec![event(1), event(2)], ExpectedVersion::NoStream)
            .unwrap();

        let seen: Vec<(u64, serde_json::Value)> = sub
            .drain()
            .into_iter()
            .map(|e| (e.sequence_number(), e.payload().clone()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (1, serde_json::json!({ "n": 1 })),
                (2, serde_json::json!({ "n": 2 })),
            ]
        );
    }

    #[test]
    fn failed_append_publishes_nothing() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>> =
            Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus.clone());

        let err = store
            .append(
                vec![UncommittedEvent {
                    event_id: Uuid::now_v7(),
                    aggregate_id: AggregateId::new(),
                    aggregate_type: "job.execution".into(),
                    event_type: "job.execution.step".into(),
                    event_version: 1,
                    occurred_at: Utc::now(),
                    payload: serde_json::json!({}),
                }],
                ExpectedVersion::Exact(5),
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert!(sub.drain().is_empty());
    }
}
