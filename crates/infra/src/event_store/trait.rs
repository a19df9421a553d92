use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use std::sync::Arc;
use viewforge_core::{ExpectedVersion, StreamId};
use viewforge_events::{Event, EventEnvelope};

use crate::storage::StorageError;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Build it from a typed domain event with [`UncommittedEvent::from_typed`],
/// which captures the type tag, schema version and business time next to the
/// JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub stream_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream.
///
/// ## Positions
///
/// - `sequence_number` is stream-scoped, contiguous, starting at 1
/// - `global_position` is store-wide and strictly increasing in commit order
///   (used by rebuilds to replay every stream in the order it was written)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub stream_type: String,

    /// Monotonically increasing position in the stream.
    pub sequence_number: u64,
    pub global_position: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.stream_id,
            self.stream_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    pub fn from_typed<E>(
        stream_id: StreamId,
        stream_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, StorageError>
    where
        E: Event,
    {
        let payload = event
            .to_payload()
            .map_err(|e| StorageError::Serialization(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            stream_id,
            stream_type: stream_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }

    /// Envelope this event will have once committed at `sequence_number`.
    pub fn to_envelope(&self, sequence_number: u64) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.stream_id,
            self.stream_type.clone(),
            sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
    }
}

/// Append-only event log.
///
/// ## Append Semantics
///
/// `append()`:
/// - requires every event of the batch to target the same stream
/// - checks optimistic concurrency against the current stream version
/// - assigns sequence numbers starting at `current_version + 1`
/// - persists the batch atomically (all or nothing)
///
/// ## Load Semantics
///
/// - `load_stream()` returns the stream in sequence order; an unknown stream
///   is an empty vector, not an error
/// - `load_all()` returns every stored event in global position order
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, StorageError>;

    fn load_all(&self) -> Result<Vec<StoredEvent>, StorageError>;

    /// Sequence number of the last event in the stream (0 when empty).
    fn stream_version(&self, stream_id: StreamId) -> Result<u64, StorageError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, StorageError> {
        (**self).load_stream(stream_id)
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, StorageError> {
        (**self).load_all()
    }

    fn stream_version(&self, stream_id: StreamId) -> Result<u64, StorageError> {
        (**self).stream_version(stream_id)
    }
}
