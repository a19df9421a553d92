use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use viewforge_core::{ExpectedVersion, StreamId, ViewId};
use viewforge_events::ViewDocument;

use super::{CommitBatch, StorageError, StreamAppend, TransactionalStore};
use crate::event_store::{EventStore, StoredEvent, UncommittedEvent};
use crate::read_model::ViewStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ViewKey {
    kind: String,
    id: ViewId,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<StreamId, Vec<StoredEvent>>,
    views: HashMap<ViewKey, ViewDocument>,
    last_position: u64,
}

impl State {
    fn stream_version(&self, stream_id: StreamId) -> u64 {
        self.streams
            .get(&stream_id)
            .and_then(|s| s.last())
            .map(|e| e.sequence_number)
            .unwrap_or(0)
    }
}

/// In-memory event log + view store with all-or-nothing commits.
///
/// Intended for tests/dev. Not optimized for performance. A single lock
/// guards both halves, so a commit is observed entirely or not at all.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StorageError> {
        self.state.read().map_err(|_| StorageError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        self.state.write().map_err(|_| StorageError::Poisoned)
    }

    fn validate(state: &State, batch: &CommitBatch) -> Result<(), StorageError> {
        if let Some(expected) = batch.expected_log_position {
            if expected != state.last_position {
                return Err(StorageError::LogMoved {
                    expected,
                    actual: state.last_position,
                });
            }
        }

        let mut seen_streams = HashSet::new();
        for append in &batch.appends {
            if !seen_streams.insert(append.stream_id) {
                return Err(StorageError::Invalid(format!(
                    "stream {} appears twice in one batch",
                    append.stream_id
                )));
            }
            Self::validate_append(state, append)?;
        }

        let cleared: HashSet<&str> = batch.clear_kinds.iter().map(String::as_str).collect();

        let mut seen_views = HashSet::new();
        let mut claimed: HashMap<(&str, &str), ViewId> = HashMap::new();

        for write in &batch.view_writes {
            let doc = &write.document;
            let key = ViewKey {
                kind: doc.kind.clone(),
                id: doc.id,
            };
            if !seen_views.insert(key.clone()) {
                return Err(StorageError::Invalid(format!("{} view {} written twice in one batch", doc.kind, doc.id)));
            }

            if !write.precondition.holds(visible_document(state, &cleared, &key)) {
                return Err(StorageError::ViewConflict {
                    kind: doc.kind.clone(),
                    id: doc.id,
                    reason: format!("precondition {:?} no longer holds", write.precondition),
                });
            }

            let Some(discriminator) = doc.discriminator.as_deref() else {
                continue;
            };

            if let Some(other) = claimed.insert((doc.kind.as_str(), discriminator), doc.id) {
                return Err(StorageError::ViewConflict {
                    kind: doc.kind.clone(),
                    id: doc.id,
                    reason: format!("discriminator '{discriminator}' also claimed by {other} in this batch"),
                });
            }

            let taken = state.views.iter().find(|(k, existing)| {
                k.kind == doc.kind
                    && k.id != doc.id
                    && existing.discriminator.as_deref() == Some(discriminator)
                    && visible_document(state, &cleared, k).is_some()
            });
            if let Some((k, _)) = taken {
                return Err(StorageError::ViewConflict {
                    kind: doc.kind.clone(),
                    id: doc.id,
                    reason: format!("discriminator '{discriminator}' already belongs to {}", k.id),
                });
            }
        }

        Ok(())
    }

    fn validate_append(state: &State, append: &StreamAppend) -> Result<(), StorageError> {
        let actual = state.stream_version(append.stream_id);
        if actual != append.base_version {
            return Err(StorageError::StreamConflict {
                stream_id: append.stream_id,
                expected: append.base_version,
                actual,
            });
        }

        let existing_type = state
            .streams
            .get(&append.stream_id)
            .and_then(|s| s.first())
            .map(|e| e.stream_type.as_str());

        for (idx, e) in append.events.iter().enumerate() {
            if e.stream_id != append.stream_id {
                return Err(StorageError::Invalid(format!(
                    "event at index {idx} targets stream {}, not {}",
                    e.stream_id, append.stream_id
                )));
            }
            let expected_type = existing_type.unwrap_or(append.events[0].stream_type.as_str());
            if e.stream_type != expected_type {
                return Err(StorageError::Invalid(format!(
                    "stream type is '{expected_type}', attempted append with '{}'",
                    e.stream_type
                )));
            }
        }

        Ok(())
    }
}

/// Current document for `key`, treating cleared kinds as already empty.
fn visible_document<'s>(state: &'s State, cleared: &HashSet<&str>, key: &ViewKey) -> Option<&'s ViewDocument> {
    if cleared.contains(key.kind.as_str()) {
        None
    } else {
        state.views.get(key)
    }
}

impl TransactionalStore for InMemoryStore {
    fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredEvent>, StorageError> {
        let mut state = self.write()?;
        Self::validate(&state, &batch)?;

        // Validation passed: nothing below can fail.
        let mut committed = Vec::new();
        for append in batch.appends {
            let mut next = append.base_version + 1;
            for e in append.events {
                state.last_position += 1;
                let stored = StoredEvent {
                    event_id: e.event_id,
                    stream_id: e.stream_id,
                    stream_type: e.stream_type,
                    sequence_number: next,
                    global_position: state.last_position,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                state.streams.entry(stored.stream_id).or_default().push(stored.clone());
                committed.push(stored);
            }
        }

        if !batch.clear_kinds.is_empty() {
            state.views.retain(|k, _| !batch.clear_kinds.contains(&k.kind));
        }

        for write in batch.view_writes {
            let key = ViewKey {
                kind: write.document.kind.clone(),
                id: write.document.id,
            };
            state.views.insert(key, write.document);
        }

        Ok(committed)
    }
}

impl EventStore for InMemoryStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let stream_id = first.stream_id;

        // `commit` re-checks the version under the write lock.
        let current = self.stream_version(stream_id)?;
        let base_version = match expected_version {
            ExpectedVersion::Any => current,
            ExpectedVersion::Exact(v) => v,
        };

        self.commit(CommitBatch {
            appends: vec![StreamAppend {
                stream_id,
                base_version,
                events,
            }],
            ..CommitBatch::default()
        })
    }

    fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, StorageError> {
        let state = self.read()?;
        Ok(state.streams.get(&stream_id).cloned().unwrap_or_default())
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, StorageError> {
        let state = self.read()?;
        let mut all: Vec<StoredEvent> = state.streams.values().flatten().cloned().collect();
        all.sort_by_key(|e| e.global_position);
        Ok(all)
    }

    fn stream_version(&self, stream_id: StreamId) -> Result<u64, StorageError> {
        Ok(self.read()?.stream_version(stream_id))
    }
}

impl ViewStore for InMemoryStore {
    fn load(&self, kind: &str, id: ViewId) -> Result<Option<ViewDocument>, StorageError> {
        let state = self.read()?;
        let key = ViewKey {
            kind: kind.to_string(),
            id,
        };
        Ok(state.views.get(&key).cloned())
    }

    fn query_one(
        &self,
        kind: &str,
        predicate: &dyn Fn(&ViewDocument) -> bool,
    ) -> Result<Option<ViewDocument>, StorageError> {
        let state = self.read()?;
        let mut matches = state
            .views
            .iter()
            .filter(|(k, doc)| k.kind == kind && predicate(doc))
            .map(|(_, doc)| doc);

        let Some(found) = matches.next() else {
            return Ok(None);
        };
        let extra = matches.count();
        if extra > 0 {
            return Err(StorageError::MultipleMatches {
                kind: kind.to_string(),
                count: extra + 1,
            });
        }
        Ok(Some(found.clone()))
    }

    fn list(&self, kind: &str) -> Result<Vec<ViewDocument>, StorageError> {
        let state = self.read()?;
        let mut docs: Vec<ViewDocument> = state.views.values().filter(|d| d.kind == kind).cloned().collect();
        docs.sort_by_key(|d| d.id);
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::read_model::{ViewWrite, WritePrecondition};

    fn event(stream_id: StreamId, tag: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            stream_id,
            stream_type: "test".to_string(),
            event_type: tag.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({ "tag": tag }),
        }
    }

    fn doc(kind: &str, id: ViewId, version: u64, discriminator: Option<&str>) -> ViewDocument {
        ViewDocument {
            kind: kind.to_string(),
            id,
            version,
            discriminator: discriminator.map(str::to_string),
            body: json!({ "v": version }),
        }
    }

    fn create(document: ViewDocument) -> ViewWrite {
        ViewWrite {
            document,
            precondition: WritePrecondition::MustNotExist,
        }
    }

    #[test]
    fn append_assigns_sequence_and_global_positions() {
        let store = InMemoryStore::new();
        let a = StreamId::new();
        let b = StreamId::new();

        store.append(vec![event(a, "x"), event(a, "y")], ExpectedVersion::Exact(0)).unwrap();
        store.append(vec![event(b, "z")], ExpectedVersion::Any).unwrap();
        store.append(vec![event(a, "w")], ExpectedVersion::Exact(2)).unwrap();

        let seqs: Vec<u64> = store.load_stream(a).unwrap().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let tags: Vec<String> = store.load_all().unwrap().into_iter().map(|e| e.event_type).collect();
        assert_eq!(tags, vec!["x", "y", "z", "w"]);
        assert_eq!(store.stream_version(b).unwrap(), 1);
    }

    #[test]
    fn stale_expected_version_is_a_stream_conflict() {
        let store = InMemoryStore::new();
        let a = StreamId::new();
        store.append(vec![event(a, "x")], ExpectedVersion::Exact(0)).unwrap();

        let err = store.append(vec![event(a, "y")], ExpectedVersion::Exact(0)).unwrap_err();
        assert_eq!(
            err,
            StorageError::StreamConflict {
                stream_id: a,
                expected: 0,
                actual: 1
            }
        );
    }

    #[test]
    fn failed_commit_applies_nothing() {
        let store = InMemoryStore::new();
        let a = StreamId::new();
        let b = StreamId::new();
        store.append(vec![event(b, "x")], ExpectedVersion::Exact(0)).unwrap();

        let view_id = ViewId::new();
        let batch = CommitBatch {
            appends: vec![
                StreamAppend {
                    stream_id: a,
                    base_version: 0,
                    events: vec![event(a, "ok")],
                },
                StreamAppend {
                    stream_id: b,
                    base_version: 0,
                    events: vec![event(b, "stale")],
                },
            ],
            clear_kinds: vec![],
            view_writes: vec![create(doc("k", view_id, 1, None))],
            expected_log_position: None,
        };

        assert!(store.commit(batch).unwrap_err().is_conflict());
        assert!(store.load_stream(a).unwrap().is_empty());
        assert!(store.load("k", view_id).unwrap().is_none());
    }

    #[test]
    fn view_version_precondition_is_checked() {
        let store = InMemoryStore::new();
        let id = ViewId::new();
        store
            .commit(CommitBatch {
                view_writes: vec![create(doc("k", id, 1, None))],
                ..CommitBatch::default()
            })
            .unwrap();

        let stale = CommitBatch {
            view_writes: vec![create(doc("k", id, 1, None))],
            ..CommitBatch::default()
        };
        assert!(matches!(store.commit(stale), Err(StorageError::ViewConflict { .. })));

        let fresh = CommitBatch {
            view_writes: vec![ViewWrite {
                document: doc("k", id, 2, None),
                precondition: WritePrecondition::Version(1),
            }],
            ..CommitBatch::default()
        };
        store.commit(fresh).unwrap();
        assert_eq!(store.load("k", id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn discriminator_is_unique_per_kind() {
        let store = InMemoryStore::new();
        let first = ViewId::new();
        store
            .commit(CommitBatch {
                view_writes: vec![create(doc("k", first, 1, Some("singleton")))],
                ..CommitBatch::default()
            })
            .unwrap();

        let second = CommitBatch {
            view_writes: vec![create(doc("k", ViewId::new(), 1, Some("singleton")))],
            ..CommitBatch::default()
        };
        assert!(matches!(store.commit(second), Err(StorageError::ViewConflict { .. })));

        // Other kinds may reuse the discriminator.
        store
            .commit(CommitBatch {
                view_writes: vec![create(doc("other", ViewId::new(), 1, Some("singleton")))],
                ..CommitBatch::default()
            })
            .unwrap();
        assert_eq!(store.list("k").unwrap().len(), 1);
    }

    #[test]
    fn same_discriminator_twice_in_one_batch_conflicts() {
        let store = InMemoryStore::new();
        let batch = CommitBatch {
            view_writes: vec![
                create(doc("k", ViewId::new(), 1, Some("singleton"))),
                create(doc("k", ViewId::new(), 1, Some("singleton"))),
            ],
            ..CommitBatch::default()
        };
        assert!(matches!(store.commit(batch), Err(StorageError::ViewConflict { .. })));
        assert!(store.list("k").unwrap().is_empty());
    }

    #[test]
    fn clear_kind_replaces_documents() {
        let store = InMemoryStore::new();
        let old = ViewId::new();
        store
            .commit(CommitBatch {
                view_writes: vec![create(doc("k", old, 3, Some("singleton")))],
                ..CommitBatch::default()
            })
            .unwrap();

        let fresh = ViewId::new();
        store
            .commit(CommitBatch {
                clear_kinds: vec!["k".to_string()],
                view_writes: vec![create(doc("k", fresh, 1, Some("singleton")))],
                ..CommitBatch::default()
            })
            .unwrap();

        let docs = store.list("k").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, fresh);
    }

    #[test]
    fn log_position_guard_rejects_a_moved_log() {
        let store = InMemoryStore::new();
        let a = StreamId::new();
        store.append(vec![event(a, "x")], ExpectedVersion::Exact(0)).unwrap();

        let id = ViewId::new();
        let stale = CommitBatch {
            view_writes: vec![create(doc("k", id, 1, None))],
            expected_log_position: Some(0),
            ..CommitBatch::default()
        };
        let err = store.commit(stale).unwrap_err();
        assert_eq!(err, StorageError::LogMoved { expected: 0, actual: 1 });
        assert!(err.is_conflict());
        assert!(store.load("k", id).unwrap().is_none());

        let current = CommitBatch {
            view_writes: vec![create(doc("k", id, 1, None))],
            expected_log_position: Some(1),
            ..CommitBatch::default()
        };
        store.commit(current).unwrap();
        assert!(store.load("k", id).unwrap().is_some());
    }

    #[test]
    fn query_one_rejects_multiple_matches() {
        let store = InMemoryStore::new();
        store
            .commit(CommitBatch {
                view_writes: vec![create(doc("k", ViewId::new(), 1, None)), create(doc("k", ViewId::new(), 1, None))],
                ..CommitBatch::default()
            })
            .unwrap();

        let err = store.query_one("k", &|_| true).unwrap_err();
        assert_eq!(
            err,
            StorageError::MultipleMatches {
                kind: "k".to_string(),
                count: 2
            }
        );
        assert!(store.query_one("missing", &|_| true).unwrap().is_none());
    }
}
