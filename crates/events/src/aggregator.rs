//! Live aggregation: fold an ordered stream into an aggregate.
//!
//! Aggregates are **disposable**; events are the source of truth. The fold is
//! pure (no IO, no clock) so replaying the same envelopes always yields the
//! same state.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::trace;

use viewforge_core::{Aggregate, DomainError, StreamId};

use crate::{Event, EventEnvelope};

/// Tracks fold progress for a single stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    stream_id: StreamId,
    last_sequence_number: u64,
}

impl StreamCursor {
    /// Cursor positioned before the first event of `stream_id`.
    pub fn new(stream_id: StreamId) -> Self {
        Self::at(stream_id, 0)
    }

    /// Cursor positioned after `last_sequence_number`.
    pub fn at(stream_id: StreamId, last_sequence_number: u64) -> Self {
        Self {
            stream_id,
            last_sequence_number,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }

    /// Accept the next event, enforcing stream identity and gap-free ordering.
    pub fn advance(&mut self, stream_id: StreamId, sequence_number: u64) -> Result<(), AggregationError> {
        if stream_id != self.stream_id {
            return Err(AggregationError::StreamMismatch {
                expected: self.stream_id,
                found: stream_id,
            });
        }

        let expected = self.last_sequence_number + 1;
        if sequence_number != expected {
            return Err(AggregationError::OutOfOrderEvents {
                stream_id,
                expected,
                found: sequence_number,
            });
        }

        self.last_sequence_number = sequence_number;
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("out-of-order events in stream {stream_id} (expected sequence {expected}, found {found})")]
    OutOfOrderEvents {
        stream_id: StreamId,
        expected: u64,
        found: u64,
    },

    #[error("event belongs to stream {found}, expected {expected}")]
    StreamMismatch { expected: StreamId, found: StreamId },

    #[error("{entity} '{id}' not found (event sequence {sequence_number})")]
    RecordNotFound {
        entity: &'static str,
        id: String,
        sequence_number: u64,
    },

    #[error("failed to decode '{event_type}' at sequence {sequence_number}: {reason}")]
    Decode {
        event_type: String,
        sequence_number: u64,
        reason: String,
    },

    #[error(transparent)]
    Domain(DomainError),
}

/// Fold stored envelopes (JSON payloads) onto `A::empty(stream_id)`.
///
/// - Envelopes must be the stream's events in ascending, gap-free order
///   starting at sequence 1.
/// - Tags unknown to `A::Event` still advance the cursor but are otherwise
///   ignored.
/// - Returns `Ok(None)` when nothing was folded: an aggregate does not exist
///   before its first event.
pub fn aggregate<'a, A, I>(stream_id: StreamId, events: I) -> Result<Option<A>, AggregationError>
where
    A: Aggregate<Id = StreamId>,
    A::Event: Event,
    I: IntoIterator<Item = &'a EventEnvelope<JsonValue>>,
{
    let mut cursor = StreamCursor::new(stream_id);
    let mut state = A::empty(stream_id);
    let mut folded = 0usize;

    for envelope in events {
        cursor.advance(envelope.stream_id(), envelope.sequence_number())?;

        let Some(event) = decode::<A::Event>(envelope)? else {
            trace!(
                stream_id = %stream_id,
                sequence_number = envelope.sequence_number(),
                event_type = envelope.event_type(),
                "no apply rule for event type; skipped"
            );
            continue;
        };

        apply_event(&mut state, &event, envelope.sequence_number())?;
        folded += 1;
    }

    Ok((folded > 0).then_some(state))
}

/// Fold already-decoded envelopes; same ordering rules as [`aggregate`].
pub fn aggregate_typed<'a, A, I>(stream_id: StreamId, events: I) -> Result<Option<A>, AggregationError>
where
    A: Aggregate<Id = StreamId>,
    A::Event: 'a,
    I: IntoIterator<Item = &'a EventEnvelope<A::Event>>,
{
    let mut cursor = StreamCursor::new(stream_id);
    let mut state = A::empty(stream_id);
    let mut folded = 0usize;

    for envelope in events {
        cursor.advance(envelope.stream_id(), envelope.sequence_number())?;
        apply_event(&mut state, envelope.payload(), envelope.sequence_number())?;
        folded += 1;
    }

    Ok((folded > 0).then_some(state))
}

pub(crate) fn decode<E: Event>(envelope: &EventEnvelope<JsonValue>) -> Result<Option<E>, AggregationError> {
    E::from_payload(envelope.event_type(), envelope.payload()).map_err(|e| AggregationError::Decode {
        event_type: envelope.event_type().to_string(),
        sequence_number: envelope.sequence_number(),
        reason: e.to_string(),
    })
}

pub(crate) fn apply_event<A: Aggregate>(
    state: &mut A,
    event: &A::Event,
    sequence_number: u64,
) -> Result<(), AggregationError> {
    state.apply(event).map_err(|err| match err {
        DomainError::RecordNotFound { entity, id } => AggregationError::RecordNotFound {
            entity,
            id,
            sequence_number,
        },
        other => AggregationError::Domain(other),
    })
}
