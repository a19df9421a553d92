use serde::{Deserialize, Serialize};
use uuid::Uuid;

use viewforge_core::StreamId;

/// Envelope for an event, containing stream metadata.
///
/// Notes:
/// - **Append-only**: `sequence_number` is contiguous per stream, starting at 1.
/// - `event_type` is the dispatch tag; `payload` is either the raw JSON
///   (`EventEnvelope<JsonValue>`) or an already decoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    stream_id: StreamId,
    stream_type: String,

    /// Position in the stream (1-based, gap-free).
    sequence_number: u64,

    event_type: String,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        stream_id: StreamId,
        stream_type: impl Into<String>,
        sequence_number: u64,
        event_type: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            stream_type: stream_type.into(),
            sequence_number,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Same metadata, different payload.
    pub fn with_payload<T>(&self, payload: T) -> EventEnvelope<T> {
        EventEnvelope {
            event_id: self.event_id,
            stream_id: self.stream_id,
            stream_type: self.stream_type.clone(),
            sequence_number: self.sequence_number,
            event_type: self.event_type.clone(),
            payload,
        }
    }
}
