//! Document session: the unit of work that appends events and commits the
//! inline projections of those events in the same transaction.
//!
//! ```text
//! append(...)*            stage typed events per stream
//!   ↓
//! save_changes()
//!   1. read stream versions, check expectations, number the events
//!   2. run the inline projection engine against a fresh read
//!   3. commit events + view writes atomically
//!   4. on a retryable conflict, go back to 1 (bounded)
//! ```

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use viewforge_core::{ExpectedVersion, StreamId};
use viewforge_events::{Event, EventEnvelope};

use crate::event_store::{StoredEvent, UncommittedEvent};
use crate::inline::{InlineProjectionEngine, ProjectionFailure};
use crate::storage::{CommitBatch, DocumentStore, StorageError, StreamAppend};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// An `Exact` expectation did not hold. Not retried: the caller decided
    /// against a state that no longer exists.
    #[error("stream {stream_id} is at version {actual}, expected {expected:?}")]
    StreamConflict {
        stream_id: StreamId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("commit still conflicting after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    #[error(transparent)]
    Storage(StorageError),

    #[error("invalid session usage: {0}")]
    Invalid(String),
}

/// Result of a successful `save_changes`.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub committed: Vec<StoredEvent>,
    /// Projections that failed and were left out of the commit.
    pub failures: Vec<ProjectionFailure>,
    pub views_written: usize,
    pub attempts: u32,
}

impl CommitOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PendingStream {
    pub(crate) stream_id: StreamId,
    pub(crate) expected: ExpectedVersion,
    pub(crate) events: Vec<UncommittedEvent>,
}

/// Unit of work over a [`DocumentStore`].
pub struct ProjectionSession<S> {
    store: S,
    engine: Arc<InlineProjectionEngine>,
    pending: Vec<PendingStream>,
}

impl<S> ProjectionSession<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, engine: Arc<InlineProjectionEngine>) -> Self {
        Self {
            store,
            engine,
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of staged events across all streams.
    pub fn pending_events(&self) -> usize {
        self.pending.iter().map(|p| p.events.len()).sum()
    }

    /// Stage `events` for `stream_id`.
    ///
    /// Appending to one stream twice in a session extends the first append;
    /// the second call must then use `ExpectedVersion::Any`.
    pub fn append<E>(
        &mut self,
        stream_id: StreamId,
        stream_type: &str,
        expected: ExpectedVersion,
        events: impl IntoIterator<Item = E>,
    ) -> Result<&mut Self, SessionError>
    where
        E: Event,
    {
        let events = events
            .into_iter()
            .map(|e| UncommittedEvent::from_typed(stream_id, stream_type, Uuid::now_v7(), &e))
            .collect::<Result<Vec<_>, _>>()
            .map_err(SessionError::Storage)?;

        match self.pending.iter_mut().find(|p| p.stream_id == stream_id) {
            Some(existing) => {
                if expected != ExpectedVersion::Any {
                    return Err(SessionError::Invalid(format!(
                        "stream {stream_id} already has pending events; further appends must use ExpectedVersion::Any"
                    )));
                }
                existing.events.extend(events);
            }
            None => self.pending.push(PendingStream {
                stream_id,
                expected,
                events,
            }),
        }
        Ok(self)
    }

    /// Stage the first events of a new stream (`ExpectedVersion::Exact(0)`).
    pub fn start_stream<E>(
        &mut self,
        stream_id: StreamId,
        stream_type: &str,
        events: impl IntoIterator<Item = E>,
    ) -> Result<&mut Self, SessionError>
    where
        E: Event,
    {
        self.append(stream_id, stream_type, ExpectedVersion::Exact(0), events)
    }

    /// Commit everything staged so far.
    ///
    /// Pending events are kept when the commit fails, so the caller may call
    /// `save_changes` again or drop the session.
    pub fn save_changes(&mut self) -> Result<CommitOutcome, SessionError> {
        let outcome = commit_pending(&self.store, &self.engine, &self.pending)?;
        self.pending.clear();
        Ok(outcome)
    }
}

/// Number, project and commit `pending`, retrying retryable conflicts.
#[instrument(skip_all, fields(streams = pending.len()))]
pub(crate) fn commit_pending<S>(
    store: &S,
    engine: &InlineProjectionEngine,
    pending: &[PendingStream],
) -> Result<CommitOutcome, SessionError>
where
    S: DocumentStore + ?Sized,
{
    let pending: Vec<&PendingStream> = pending.iter().filter(|p| !p.events.is_empty()).collect();
    if pending.is_empty() {
        return Ok(CommitOutcome::default());
    }

    let max_attempts = engine.config().max_commit_attempts;

    for attempt in 1..=max_attempts {
        let mut appends = Vec::with_capacity(pending.len());
        let mut envelopes: Vec<EventEnvelope<JsonValue>> = Vec::new();

        for p in &pending {
            let current = store.stream_version(p.stream_id).map_err(SessionError::Storage)?;
            if !p.expected.matches(current) {
                return Err(SessionError::StreamConflict {
                    stream_id: p.stream_id,
                    expected: p.expected,
                    actual: current,
                });
            }

            envelopes.extend(
                p.events
                    .iter()
                    .zip(current + 1..)
                    .map(|(event, seq)| event.to_envelope(seq)),
            );
            appends.push(StreamAppend {
                stream_id: p.stream_id,
                base_version: current,
                events: p.events.clone(),
            });
        }

        let projected = engine.project(&envelopes, store);
        let views_written = projected.writes.len();
        let batch = CommitBatch {
            appends,
            clear_kinds: Vec::new(),
            view_writes: projected.writes,
            expected_log_position: None,
        };

        match store.commit(batch) {
            Ok(committed) => {
                info!(
                    events = committed.len(),
                    views = views_written,
                    failures = projected.failures.len(),
                    attempt,
                    "unit of work committed"
                );
                return Ok(CommitOutcome {
                    committed,
                    failures: projected.failures,
                    views_written,
                    attempts: attempt,
                });
            }
            Err(err) if is_retryable(&err, &pending) => {
                warn!(attempt, max_attempts, error = %err, "commit conflict; retrying with fresh reads");
            }
            Err(StorageError::StreamConflict {
                stream_id, actual, ..
            }) => {
                let expected = pending
                    .iter()
                    .find(|p| p.stream_id == stream_id)
                    .map(|p| p.expected)
                    .unwrap_or(ExpectedVersion::Any);
                return Err(SessionError::StreamConflict {
                    stream_id,
                    expected,
                    actual,
                });
            }
            Err(err) => return Err(SessionError::Storage(err)),
        }
    }

    error!(attempts = max_attempts, "giving up on conflicting commit");
    Err(SessionError::ConcurrencyConflict { attempts: max_attempts })
}

/// View conflicts are always retried (a racing writer touched a view); stream
/// conflicts only for streams appended with `ExpectedVersion::Any`.
fn is_retryable(err: &StorageError, pending: &[&PendingStream]) -> bool {
    match err {
        StorageError::ViewConflict { .. } => true,
        StorageError::StreamConflict { stream_id, .. } => pending
            .iter()
            .any(|p| p.stream_id == *stream_id && p.expected == ExpectedVersion::Any),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use viewforge_core::ViewId;
    use viewforge_events::{AggregateProjection, ProjectionRegistry, ViewDocument};
    use viewforge_issues::{IssueEvent, IssueId, IssuesList};

    use crate::config::EngineConfig;
    use crate::event_store::EventStore;
    use crate::read_model::{ViewStore, load_view};
    use crate::storage::{InMemoryStore, TransactionalStore};

    fn engine(config: EngineConfig) -> Arc<InlineProjectionEngine> {
        let registry = ProjectionRegistry::builder()
            .with(AggregateProjection::<IssuesList>::new())
            .build()
            .unwrap();
        Arc::new(InlineProjectionEngine::new(Arc::new(registry), config).unwrap())
    }

    #[test]
    fn save_changes_commits_events_and_views_together() {
        let store = Arc::new(InMemoryStore::new());
        let mut session = ProjectionSession::new(store.clone(), engine(EngineConfig::default()));
        let stream_id = StreamId::new();
        let issue_id = IssueId::from(stream_id);

        session
            .start_stream(stream_id, "issues_list", [IssueEvent::created(issue_id, "X1")])
            .unwrap();
        assert_eq!(session.pending_events(), 1);

        let outcome = session.save_changes().unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.views_written, 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(session.pending_events(), 0);

        let view: IssuesList = load_view(store.as_ref(), ViewId::from(stream_id)).unwrap().unwrap();
        assert_eq!(view.items().len(), 1);
    }

    #[test]
    fn exact_expectation_mismatch_is_not_retried_and_keeps_pending() {
        let store = Arc::new(InMemoryStore::new());
        let stream_id = StreamId::new();
        let issue_id = IssueId::from(stream_id);

        let mut first = ProjectionSession::new(store.clone(), engine(EngineConfig::default()));
        first
            .start_stream(stream_id, "issues_list", [IssueEvent::created(issue_id, "X1")])
            .unwrap();
        first.save_changes().unwrap();

        let mut second = ProjectionSession::new(store.clone(), engine(EngineConfig::default()));
        second
            .start_stream(stream_id, "issues_list", [IssueEvent::created(issue_id, "again")])
            .unwrap();
        let err = second.save_changes().unwrap_err();
        assert_eq!(
            err,
            SessionError::StreamConflict {
                stream_id,
                expected: ExpectedVersion::Exact(0),
                actual: 1,
            }
        );
        assert_eq!(second.pending_events(), 1);
        assert_eq!(store.stream_version(stream_id).unwrap(), 1);
    }

    #[test]
    fn second_append_to_same_stream_requires_any() {
        let store = InMemoryStore::new();
        let mut session = ProjectionSession::new(store, engine(EngineConfig::default()));
        let stream_id = StreamId::new();
        let issue_id = IssueId::from(stream_id);

        session
            .start_stream(stream_id, "issues_list", [IssueEvent::created(issue_id, "a")])
            .unwrap();
        assert!(matches!(
            session.append(stream_id, "issues_list", ExpectedVersion::Exact(1), [IssueEvent::updated(issue_id, "b")]),
            Err(SessionError::Invalid(_))
        ));
        session
            .append(stream_id, "issues_list", ExpectedVersion::Any, [IssueEvent::updated(issue_id, "b")])
            .unwrap();

        let outcome = session.save_changes().unwrap();
        let seqs: Vec<u64> = outcome.committed.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn empty_session_commits_nothing() {
        let store = InMemoryStore::new();
        let mut session = ProjectionSession::new(store, engine(EngineConfig::default()));
        let outcome = session.save_changes().unwrap();
        assert!(outcome.committed.is_empty());
        assert_eq!(outcome.attempts, 0);
    }

    /// Store whose first `conflicts` commits fail with a view conflict.
    struct Flaky {
        inner: InMemoryStore,
        conflicts: AtomicU32,
    }

    impl EventStore for Flaky {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, StorageError> {
            self.inner.append(events, expected_version)
        }

        fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, StorageError> {
            self.inner.load_stream(stream_id)
        }

        fn load_all(&self) -> Result<Vec<StoredEvent>, StorageError> {
            self.inner.load_all()
        }

        fn stream_version(&self, stream_id: StreamId) -> Result<u64, StorageError> {
            self.inner.stream_version(stream_id)
        }
    }

    impl ViewStore for Flaky {
        fn load(&self, kind: &str, id: ViewId) -> Result<Option<ViewDocument>, StorageError> {
            self.inner.load(kind, id)
        }

        fn query_one(
            &self,
            kind: &str,
            predicate: &dyn Fn(&ViewDocument) -> bool,
        ) -> Result<Option<ViewDocument>, StorageError> {
            self.inner.query_one(kind, predicate)
        }

        fn list(&self, kind: &str) -> Result<Vec<ViewDocument>, StorageError> {
            self.inner.list(kind)
        }
    }

    impl TransactionalStore for Flaky {
        fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredEvent>, StorageError> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::ViewConflict {
                    kind: "issues_list".to_string(),
                    id: ViewId::new(),
                    reason: "injected".to_string(),
                });
            }
            self.inner.commit(batch)
        }
    }

    fn flaky(conflicts: u32) -> Flaky {
        Flaky {
            inner: InMemoryStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }
    }

    #[test]
    fn view_conflicts_are_retried_until_success() {
        let mut session = ProjectionSession::new(flaky(2), engine(EngineConfig::default()));
        let stream_id = StreamId::new();
        session
            .start_stream(stream_id, "issues_list", [IssueEvent::created(IssueId::new(), "a")])
            .unwrap();

        let outcome = session.save_changes().unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(session.store().stream_version(stream_id).unwrap(), 1);
    }

    #[test]
    fn retries_are_bounded() {
        let config = EngineConfig {
            max_commit_attempts: 2,
            ..EngineConfig::default()
        };
        let mut session = ProjectionSession::new(flaky(5), engine(config));
        let stream_id = StreamId::new();
        session
            .start_stream(stream_id, "issues_list", [IssueEvent::created(IssueId::new(), "a")])
            .unwrap();

        let err = session.save_changes().unwrap_err();
        assert_eq!(err, SessionError::ConcurrencyConflict { attempts: 2 });
        assert_eq!(session.store().stream_version(stream_id).unwrap(), 0);
    }
}
