//! Atomic commit boundary shared by the event log and the view store.
//!
//! A [`CommitBatch`] carries everything one unit of work produced: appended
//! events for one or more streams plus the view documents projected from
//! them. Storage applies it entirely or not at all.

pub mod in_memory;

use std::sync::Arc;

use thiserror::Error;

use viewforge_core::{StreamId, ViewId};

use crate::event_store::{EventStore, StoredEvent, UncommittedEvent};
use crate::read_model::{ViewStore, ViewWrite};

pub use in_memory::InMemoryStore;

/// Storage operation error.
///
/// These are infrastructure errors (concurrency, integrity, serialization)
/// as opposed to domain errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("stream {stream_id} is at version {actual}, expected {expected}")]
    StreamConflict {
        stream_id: StreamId,
        expected: u64,
        actual: u64,
    },

    #[error("conflicting write to {kind} view {id}: {reason}")]
    ViewConflict { kind: String, id: ViewId, reason: String },

    #[error("{count} {kind} views match a query that expects at most one")]
    MultipleMatches { kind: String, count: usize },

    #[error("event log is at position {actual}, expected {expected}")]
    LogMoved { expected: u64, actual: u64 },

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid commit: {0}")]
    Invalid(String),
}

impl StorageError {
    /// Whether re-running the unit of work against fresh reads may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::StreamConflict { .. } | StorageError::ViewConflict { .. } | StorageError::LogMoved { .. }
        )
    }
}

/// Events for one stream, numbered from `base_version + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamAppend {
    pub stream_id: StreamId,
    /// Stream version the events were numbered (and projected) against.
    pub base_version: u64,
    pub events: Vec<UncommittedEvent>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    pub appends: Vec<StreamAppend>,
    /// View kinds whose documents are all deleted before `view_writes` apply.
    pub clear_kinds: Vec<String>,
    pub view_writes: Vec<ViewWrite>,
    /// Global position of the last event the batch was computed from; the
    /// commit is rejected with [`StorageError::LogMoved`] if the log has
    /// grown since.
    pub expected_log_position: Option<u64>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.appends.iter().all(|a| a.events.is_empty()) && self.clear_kinds.is_empty() && self.view_writes.is_empty()
    }
}

/// All-or-nothing commit of events and view writes.
///
/// Implementations must validate the log position, every stream version,
/// every write precondition and `(kind, discriminator)` uniqueness before
/// applying anything.
pub trait TransactionalStore: Send + Sync {
    /// Returns the committed events in commit order.
    fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredEvent>, StorageError>;
}

impl<S> TransactionalStore for Arc<S>
where
    S: TransactionalStore + ?Sized,
{
    fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredEvent>, StorageError> {
        (**self).commit(batch)
    }
}

/// Event log, view store and atomic commit behind one handle.
pub trait DocumentStore: EventStore + ViewStore + TransactionalStore {}

impl<S> DocumentStore for S where S: EventStore + ViewStore + TransactionalStore + ?Sized {}
