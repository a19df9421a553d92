//! Projection rebuild: drop every document of a projection's kind and replay
//! the whole event log through that projection alone.
//!
//! Views are disposable, so a rebuild is the recovery path after a handler
//! bug, a failed inline projection or a new projection being registered.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use viewforge_core::ViewId;
use viewforge_events::{EventEnvelope, ProjectionRegistry, RegistryError, ViewDocument};

use crate::config::{ConfigError, EngineConfig};
use crate::inline::{InlineProjectionEngine, ProjectionFailure};
use crate::read_model::ViewStore;
use crate::storage::{CommitBatch, DocumentStore, StorageError};

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("no projection named '{0}'")]
    UnknownProjection(String),

    #[error("projection '{}' failed at {}#{}: {}", .0.projection, .0.stream_id, .0.sequence_number, .0.error)]
    Projection(Box<ProjectionFailure>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event log kept moving during rebuild after {attempts} attempts")]
    LogKeptMoving { attempts: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub projection: String,
    pub events_replayed: usize,
    pub documents_written: usize,
    pub attempts: u32,
}

/// View reader for a kind that is about to be cleared: it holds nothing.
struct Cleared;

impl ViewStore for Cleared {
    fn load(&self, _kind: &str, _id: ViewId) -> Result<Option<ViewDocument>, StorageError> {
        Ok(None)
    }

    fn query_one(
        &self,
        _kind: &str,
        _predicate: &dyn Fn(&ViewDocument) -> bool,
    ) -> Result<Option<ViewDocument>, StorageError> {
        Ok(None)
    }

    fn list(&self, _kind: &str) -> Result<Vec<ViewDocument>, StorageError> {
        Ok(Vec::new())
    }
}

/// Rebuild the documents of projection `name` from the full event log.
///
/// The clear and the rewrite are committed in one batch, guarded by the log
/// position the replay read up to. A commit that lands in between moves the
/// log and the replay starts over, up to `max_commit_attempts` times. When the
/// projection fails on any event, nothing is committed and the old documents
/// stay.
#[instrument(skip(store, registry, config))]
pub fn rebuild_projection<S>(
    store: &S,
    registry: &ProjectionRegistry,
    name: &str,
    config: &EngineConfig,
) -> Result<RebuildReport, RebuildError>
where
    S: DocumentStore + ?Sized,
{
    let projection = registry
        .get(name)
        .ok_or_else(|| RebuildError::UnknownProjection(name.to_string()))?;

    let single = ProjectionRegistry::builder().with_shared(Arc::clone(projection)).build()?;
    let engine = InlineProjectionEngine::new(
        Arc::new(single),
        EngineConfig {
            stop_projection_on_failure: true,
            ..*config
        },
    )?;
    let max_attempts = config.max_commit_attempts;

    for attempt in 1..=max_attempts {
        let stored = store.load_all()?;
        let log_position = stored.last().map(|e| e.global_position).unwrap_or(0);
        let events: Vec<EventEnvelope<JsonValue>> = stored.iter().map(|e| e.to_envelope()).collect();
        let mut projected = engine.project(&events, &Cleared);

        if let Some(failure) = projected.failures.pop() {
            return Err(RebuildError::Projection(Box::new(failure)));
        }

        let documents_written = projected.writes.len();
        let batch = CommitBatch {
            appends: Vec::new(),
            clear_kinds: vec![projection.view_kind().to_string()],
            view_writes: projected.writes,
            expected_log_position: Some(log_position),
        };

        match store.commit(batch) {
            Ok(_) => {
                info!(
                    projection = name,
                    events = events.len(),
                    documents = documents_written,
                    attempt,
                    "projection rebuilt"
                );
                return Ok(RebuildReport {
                    projection: name.to_string(),
                    events_replayed: events.len(),
                    documents_written,
                    attempts: attempt,
                });
            }
            Err(StorageError::LogMoved { expected, actual }) => {
                warn!(projection = name, attempt, expected, actual, "event log moved during rebuild; replaying again");
            }
            Err(err) => return Err(RebuildError::Storage(err)),
        }
    }

    error!(projection = name, attempts = max_attempts, "giving up on rebuild");
    Err(RebuildError::LogKeptMoving { attempts: max_attempts })
}
