//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Live-aggregate the stream (empty stream = A::empty)
//!   ↓
//! 2. Handle command (pure decision logic, produces events)
//!   ↓
//! 3. Append with ExpectedVersion::Exact(version read in 1), projecting
//!    inline views in the same commit
//!   ↓
//! 4. On a stream conflict, start over from 1 (bounded)
//! ```
//!
//! This module contains no IO itself; it composes the storage traits.

use std::sync::Arc;

use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use viewforge_core::{Aggregate, DomainError, ExpectedVersion, StreamId};
use viewforge_events::{AggregationError, Event};

use crate::event_store::UncommittedEvent;
use crate::inline::InlineProjectionEngine;
use crate::live::{self, LiveError};
use crate::session::{CommitOutcome, PendingStream, SessionError, commit_pending};
use crate::storage::{DocumentStore, StorageError};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Domain-level conflict (e.g. creating something twice).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("{entity} '{id}' not found")]
    RecordNotFound { entity: &'static str, id: String },

    /// The stream kept moving under us.
    #[error("stream {stream_id} still conflicting after {attempts} attempts")]
    Concurrency { stream_id: StreamId, attempts: u32 },

    /// The stored history could not be folded.
    #[error(transparent)]
    History(AggregationError),

    #[error(transparent)]
    Session(SessionError),

    #[error(transparent)]
    Store(#[from] StorageError),
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::RecordNotFound { entity, id } => DispatchError::RecordNotFound { entity, id },
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

impl From<LiveError> for DispatchError {
    fn from(value: LiveError) -> Self {
        match value {
            LiveError::StreamNotFound(_) => DispatchError::NotFound,
            LiveError::Storage(err) => DispatchError::Store(err),
            LiveError::Aggregation(err) => DispatchError::History(err),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// ## Execution Guarantees
///
/// - **Atomicity**: events and the inline views derived from them are
///   committed together
/// - **Consistency**: the decision is made against the live aggregate and
///   appended with an exact expected version
/// - **Isolation**: each command operates on a single stream
#[derive(Debug)]
pub struct CommandDispatcher<S> {
    store: S,
    engine: Arc<InlineProjectionEngine>,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S, engine: Arc<InlineProjectionEngine>) -> Self {
        Self { store, engine }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: DocumentStore,
{
    /// Dispatch a command through the full pipeline.
    ///
    /// Returns an empty outcome when the aggregate decided on no events.
    #[instrument(skip(self, command), fields(aggregate = core::any::type_name::<A>()))]
    pub fn dispatch<A>(
        &self,
        stream_id: StreamId,
        stream_type: &str,
        command: &A::Command,
    ) -> Result<CommitOutcome, DispatchError>
    where
        A: Aggregate<Id = StreamId, Error = DomainError>,
        A::Event: Event,
    {
        let max_attempts = self.engine.config().max_commit_attempts;

        for attempt in 1..=max_attempts {
            // 1) Rehydrate
            let folded = live::fold::<S, A>(&self.store, stream_id, None)?;
            let aggregate = folded.state.unwrap_or_else(|| A::empty(stream_id));

            // 2) Decide events (no mutation)
            let decided = aggregate.handle(command)?;
            if decided.is_empty() {
                return Ok(CommitOutcome::default());
            }

            // 3) Persist + project
            let events = decided
                .iter()
                .map(|ev| UncommittedEvent::from_typed(stream_id, stream_type, Uuid::now_v7(), ev))
                .collect::<Result<Vec<_>, _>>()?;
            let pending = [PendingStream {
                stream_id,
                expected: ExpectedVersion::Exact(folded.stream_version),
                events,
            }];

            match commit_pending(&self.store, &self.engine, &pending) {
                Ok(outcome) => return Ok(outcome),
                Err(SessionError::StreamConflict { actual, .. }) => {
                    warn!(
                        stream_id = %stream_id,
                        attempt,
                        read_version = folded.stream_version,
                        actual,
                        "stream moved while handling command; retrying"
                    );
                }
                Err(err) => return Err(DispatchError::Session(err)),
            }
        }

        Err(DispatchError::Concurrency {
            stream_id,
            attempts: max_attempts,
        })
    }
}
