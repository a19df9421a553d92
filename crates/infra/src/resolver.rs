//! Record resolution: which view record an event should mutate.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::trace;

use viewforge_core::ViewId;
use viewforge_events::{EventEnvelope, IdPolicy};

use crate::read_model::ViewStore;
use crate::storage::StorageError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// More than one record matched a shared policy; the singleton invariant is broken.
    #[error("{count} '{kind}' records match shared discriminator '{discriminator}'")]
    Ambiguous {
        kind: String,
        discriminator: String,
        count: usize,
    },

    /// The record holding the discriminator exists but the policy's
    /// predicate rejects it.
    #[error("'{kind}' record {id} holds discriminator '{discriminator}' but fails its predicate")]
    PredicateMismatch {
        kind: String,
        discriminator: String,
        id: ViewId,
    },

    #[error(transparent)]
    Storage(StorageError),
}

/// Outcome of resolving a target record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: ViewId,
    /// `true` when no record existed and the id was freshly generated.
    pub minted: bool,
}

/// Determine the target record id for `envelope` under `policy`.
///
/// - per-stream: the stream id, without touching storage
/// - shared: the matching record's id, or a fresh id when no record holds
///   the discriminator yet
///
/// Nothing is written here. Two concurrent units of work can both mint an id
/// for the same shared record; storage rejects the second commit on the
/// `(kind, discriminator)` uniqueness check and the session retries it.
pub fn resolve<R>(
    envelope: &EventEnvelope<JsonValue>,
    policy: &IdPolicy,
    kind: &str,
    reader: &R,
) -> Result<Resolution, ResolveError>
where
    R: ViewStore + ?Sized,
{
    let rule = match policy {
        IdPolicy::PerStream => {
            return Ok(Resolution {
                id: ViewId::from(envelope.stream_id()),
                minted: false,
            });
        }
        IdPolicy::Shared(rule) => rule,
    };

    let ambiguous = |err: StorageError| match err {
        StorageError::MultipleMatches { count, .. } => ResolveError::Ambiguous {
            kind: kind.to_string(),
            discriminator: rule.discriminator().to_string(),
            count,
        },
        other => ResolveError::Storage(other),
    };

    if let Some(doc) = reader.query_one(kind, &|doc| rule.matches(doc)).map_err(ambiguous)? {
        return Ok(Resolution {
            id: doc.id,
            minted: false,
        });
    }

    // Storage keeps one record per discriminator, so minting next to a record
    // the predicate rejects could never commit.
    let claimed = reader
        .query_one(kind, &|doc| doc.discriminator.as_deref() == Some(rule.discriminator()))
        .map_err(ambiguous)?;
    if let Some(doc) = claimed {
        return Err(ResolveError::PredicateMismatch {
            kind: kind.to_string(),
            discriminator: rule.discriminator().to_string(),
            id: doc.id,
        });
    }

    let id = ViewId::new();
    trace!(kind, discriminator = rule.discriminator(), view_id = %id, "minted shared record id");
    Ok(Resolution { id, minted: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    use viewforge_core::StreamId;
    use viewforge_events::ViewDocument;

    use crate::read_model::{ViewWrite, WritePrecondition};
    use crate::storage::{CommitBatch, InMemoryStore, TransactionalStore};

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct Counter {
        id: ViewId,
        n: u32,
    }

    impl viewforge_events::View for Counter {
        const KIND: &'static str = "k";

        fn empty(id: ViewId) -> Self {
            Self { id, n: 0 }
        }

        fn id(&self) -> ViewId {
            self.id
        }
    }

    fn envelope(stream_id: StreamId) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(Uuid::now_v7(), stream_id, "test", 1, "test.happened", json!({}))
    }

    fn insert(store: &InMemoryStore, kind: &str, discriminator: Option<&str>) -> ViewId {
        let id = ViewId::new();
        store
            .commit(CommitBatch {
                view_writes: vec![ViewWrite {
                    document: ViewDocument {
                        kind: kind.to_string(),
                        id,
                        version: 1,
                        discriminator: discriminator.map(str::to_string),
                        body: json!({}),
                    },
                    precondition: WritePrecondition::MustNotExist,
                }],
                ..CommitBatch::default()
            })
            .unwrap();
        id
    }

    #[test]
    fn per_stream_is_the_stream_id() {
        let store = InMemoryStore::new();
        let stream_id = StreamId::new();

        let resolution = resolve(&envelope(stream_id), &IdPolicy::PerStream, "k", &store).unwrap();
        assert_eq!(resolution.id, ViewId::from(stream_id));
        assert!(!resolution.minted);
    }

    #[test]
    fn shared_mints_when_absent_and_finds_when_present() {
        let store = InMemoryStore::new();
        let policy = IdPolicy::singleton();

        let first = resolve(&envelope(StreamId::new()), &policy, "k", &store).unwrap();
        assert!(first.minted);

        let existing = insert(&store, "k", Some("singleton"));
        let s1 = resolve(&envelope(StreamId::new()), &policy, "k", &store).unwrap();
        let s2 = resolve(&envelope(StreamId::new()), &policy, "k", &store).unwrap();
        assert_eq!(s1, Resolution { id: existing, minted: false });
        assert_eq!(s1, s2);
    }

    #[test]
    fn shared_ignores_records_without_the_discriminator() {
        let store = InMemoryStore::new();
        insert(&store, "k", None);

        let resolution = resolve(&envelope(StreamId::new()), &IdPolicy::singleton(), "k", &store).unwrap();
        assert!(resolution.minted);
    }

    #[test]
    fn shared_refuses_to_mint_beside_a_rejected_record() {
        let store = InMemoryStore::new();
        let existing = ViewId::new();
        store
            .commit(CommitBatch {
                view_writes: vec![ViewWrite {
                    document: ViewDocument {
                        kind: "k".to_string(),
                        id: existing,
                        version: 1,
                        discriminator: Some("open".to_string()),
                        body: json!({ "id": existing, "n": 1 }),
                    },
                    precondition: WritePrecondition::MustNotExist,
                }],
                ..CommitBatch::default()
            })
            .unwrap();
        let policy = IdPolicy::shared_by::<Counter, _>("open", |view| view.n < 1);

        let err = resolve(&envelope(StreamId::new()), &policy, "k", &store).unwrap_err();
        assert_eq!(
            err,
            ResolveError::PredicateMismatch {
                kind: "k".to_string(),
                discriminator: "open".to_string(),
                id: existing,
            }
        );
    }

    /// Reader whose storage already holds two records for one discriminator.
    struct Corrupted;

    impl ViewStore for Corrupted {
        fn load(&self, _kind: &str, _id: ViewId) -> Result<Option<ViewDocument>, StorageError> {
            Ok(None)
        }

        fn query_one(
            &self,
            kind: &str,
            _predicate: &dyn Fn(&ViewDocument) -> bool,
        ) -> Result<Option<ViewDocument>, StorageError> {
            Err(StorageError::MultipleMatches {
                kind: kind.to_string(),
                count: 2,
            })
        }

        fn list(&self, _kind: &str) -> Result<Vec<ViewDocument>, StorageError> {
            Ok(vec![])
        }
    }

    #[test]
    fn broken_singleton_is_ambiguous() {
        let err = resolve(&envelope(StreamId::new()), &IdPolicy::singleton(), "k", &Corrupted).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Ambiguous {
                kind: "k".to_string(),
                discriminator: "singleton".to_string(),
                count: 2,
            }
        );
    }

    #[test]
    fn per_stream_never_reads_storage() {
        let stream_id = StreamId::new();
        let resolution = resolve(&envelope(stream_id), &IdPolicy::PerStream, "k", &Corrupted).unwrap();
        assert_eq!(resolution.id, ViewId::from(stream_id));
    }
}
