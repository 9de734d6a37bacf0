use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

use jobflow_core::{AggregateId, ExpectedVersion};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, UncommittedEvent, batch_target, check_head,
};

/// Event store held in process memory, for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<Streams>,
}

#[derive(Debug, Default)]
struct Streams {
    by_id: HashMap<AggregateId, Vec<StoredEvent>>,
    created: Vec<AggregateId>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Streams>, EventStoreError> {
        self.streams
            .read()
            .map_err(|_| EventStoreError::Storage("event streams lock poisoned".into()))
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some((aggregate_id, batch_type)) = batch_target(&events)? else {
            return Ok(Vec::new());
        };
        let batch_type = batch_type.to_owned();

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("event streams lock poisoned".into()))?;
        let head = streams.by_id.get(&aggregate_id).and_then(|s| s.last());
        let current = head.map_or(0, |e| e.sequence_number);
        check_head(
            head.map(|e| e.aggregate_type.as_str()),
            &batch_type,
            current,
            expected_version,
        )?;

        if current == 0 {
            streams.created.push(aggregate_id);
        }
        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(event, seq)| event.at_position(seq))
            .collect();
        streams
            .by_id
            .entry(aggregate_id)
            .or_default()
            .extend(committed.iter().cloned());
        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        Ok(self.read()?.by_id.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        let streams = self.read()?;
        Ok(streams
            .created
            .iter()
            .copied()
            .filter(|id| {
                streams
                    .by_id
                    .get(id)
                    .and_then(|s| s.first())
                    .is_some_and(|e| e.aggregate_type == aggregate_type)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn sequence_numbers_continue_across_appends() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![event(id, "job.execution"), event(id, "job.execution")], ExpectedVersion::NoStream)
            .unwrap();
        let committed = store
            .append(vec![event(id, "job.execution")], ExpectedVersion::Exact(2))
            .unwrap();

        assert_eq!(committed[0].sequence_number, 3);
        assert_eq!(store.load_stream(id).unwrap().len(), 3);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![event(id, "job.execution")], ExpectedVersion::NoStream)
            .unwrap();

        let err = store
            .append(vec![event(id, "job.execution")], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn aggregate_type_is_fixed_per_stream() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![event(id, "job.execution")], ExpectedVersion::Any)
            .unwrap();
        let err = store
            .append(vec![event(id, "other")], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn list_streams_filters_by_type_in_creation_order() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        let c = AggregateId::new();
        store.append(vec![event(a, "job.execution")], ExpectedVersion::Any).unwrap();
        store.append(vec![event(b, "other")], ExpectedVersion::Any).unwrap();
        store.append(vec![event(c, "job.execution")], ExpectedVersion::Any).unwrap();
        store.append(vec![event(a, "job.execution")], ExpectedVersion::Any).unwrap();

        assert_eq!(store.list_streams("job.execution").unwrap(), vec![a, c]);
    }
}
