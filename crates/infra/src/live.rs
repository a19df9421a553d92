//! Live aggregation: rebuild an aggregate from its committed stream on demand.
//!
//! Never reads views. The result is the reference state of the stream; a
//! per-stream inline view of the same aggregate must always equal it.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument};

use viewforge_core::{Aggregate, StreamId};
use viewforge_events::{AggregationError, Event, EventEnvelope, aggregate};

use crate::event_store::EventStore;
use crate::storage::StorageError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// The stream has no events (or none the aggregate knows).
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Folded state plus the stream version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Folded<A> {
    pub state: Option<A>,
    pub stream_version: u64,
}

#[derive(Debug, Clone)]
pub struct LiveAggregator<S> {
    store: S,
}

impl<S> LiveAggregator<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Full stream, folded.
    #[instrument(skip(self), fields(aggregate = core::any::type_name::<A>()))]
    pub fn aggregate_stream<A>(&self, stream_id: StreamId) -> Result<A, LiveError>
    where
        A: Aggregate<Id = StreamId>,
        A::Event: Event,
    {
        fold(&self.store, stream_id, None)?
            .state
            .ok_or(LiveError::StreamNotFound(stream_id))
    }

    /// Stream prefix up to and including sequence `version`.
    #[instrument(skip(self), fields(aggregate = core::any::type_name::<A>()))]
    pub fn aggregate_stream_to<A>(&self, stream_id: StreamId, version: u64) -> Result<A, LiveError>
    where
        A: Aggregate<Id = StreamId>,
        A::Event: Event,
    {
        fold(&self.store, stream_id, Some(version))?
            .state
            .ok_or(LiveError::StreamNotFound(stream_id))
    }
}

/// Load and fold `stream_id`, optionally stopping at `up_to`.
pub(crate) fn fold<S, A>(store: &S, stream_id: StreamId, up_to: Option<u64>) -> Result<Folded<A>, LiveError>
where
    S: EventStore + ?Sized,
    A: Aggregate<Id = StreamId>,
    A::Event: Event,
{
    let stored = store.load_stream(stream_id)?;
    let stream_version = stored.last().map(|e| e.sequence_number).unwrap_or(0);

    let envelopes: Vec<EventEnvelope<JsonValue>> = stored
        .iter()
        .take_while(|e| up_to.is_none_or(|v| e.sequence_number <= v))
        .map(|e| e.to_envelope())
        .collect();

    let state = aggregate::<A, _>(stream_id, &envelopes)?;
    debug!(stream_id = %stream_id, events = envelopes.len(), folded = state.is_some(), "stream aggregated");

    Ok(Folded { state, stream_version })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use uuid::Uuid;
    use viewforge_core::{AggregateRoot, ExpectedVersion};
    use viewforge_issues::{IssueEvent, IssueId, IssuesList};

    use crate::event_store::UncommittedEvent;
    use crate::storage::InMemoryStore;

    fn append(store: &InMemoryStore, stream_id: StreamId, events: &[IssueEvent]) {
        let uncommitted = events
            .iter()
            .map(|e| UncommittedEvent::from_typed(stream_id, "issues_list", Uuid::now_v7(), e).unwrap())
            .collect();
        store.append(uncommitted, ExpectedVersion::Any).unwrap();
    }

    #[test]
    fn empty_stream_is_not_found() {
        let live = LiveAggregator::new(InMemoryStore::new());
        let stream_id = StreamId::new();

        let err = live.aggregate_stream::<IssuesList>(stream_id).unwrap_err();
        assert_eq!(err, LiveError::StreamNotFound(stream_id));
    }

    #[test]
    fn folds_full_stream_and_prefix() {
        let store = Arc::new(InMemoryStore::new());
        let stream_id = StreamId::new();
        let issue_id = IssueId::from(stream_id);
        append(
            &store,
            stream_id,
            &[
                IssueEvent::created(issue_id, "v1"),
                IssueEvent::updated(issue_id, "v2"),
                IssueEvent::updated(issue_id, "v3"),
            ],
        );
        let live = LiveAggregator::new(store.clone());

        let full = live.aggregate_stream::<IssuesList>(stream_id).unwrap();
        assert_eq!(full.get(issue_id).unwrap().description, "v3");
        assert_eq!(full.version(), 3);

        let at_two = live.aggregate_stream_to::<IssuesList>(stream_id, 2).unwrap();
        assert_eq!(at_two.get(issue_id).unwrap().description, "v2");
        assert_eq!(at_two.version(), 2);

        let err = live.aggregate_stream_to::<IssuesList>(stream_id, 0).unwrap_err();
        assert_eq!(err, LiveError::StreamNotFound(stream_id));
    }

    #[test]
    fn update_of_unknown_issue_surfaces_record_not_found() {
        let store = InMemoryStore::new();
        let stream_id = StreamId::new();
        append(&store, stream_id, &[IssueEvent::updated(IssueId::new(), "ghost")]);

        let live = LiveAggregator::new(store);
        let err = live.aggregate_stream::<IssuesList>(stream_id).unwrap_err();
        assert!(matches!(
            err,
            LiveError::Aggregation(AggregationError::RecordNotFound { entity: "issue", sequence_number: 1, .. })
        ));
    }

    #[test]
    fn repeated_calls_recompute_identically() {
        let store = InMemoryStore::new();
        let stream_id = StreamId::new();
        let issue_id = IssueId::from(stream_id);
        append(&store, stream_id, &[IssueEvent::created(issue_id, "once")]);
        let live = LiveAggregator::new(store);

        let first = live.aggregate_stream::<IssuesList>(stream_id).unwrap();
        let second = live.aggregate_stream::<IssuesList>(stream_id).unwrap();
        assert_eq!(first, second);
    }
}
