//! Inline projection engine.
//!
//! Runs inside the unit of work that appends events: for every projection in
//! the registry (in registration order) and every appended event (in append
//! order) it resolves the target record, loads it, applies the handler and
//! stages the new document. The staged writes are committed atomically with
//! the events by the session.
//!
//! ## Failure isolation
//!
//! Each projection works in its own [`WorkingSet`]. When a projection fails
//! on an event, its working set is discarded, the failure is recorded and the
//! projection sits out the rest of the unit. Other projections are not
//! affected, and neither is the event append.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use viewforge_core::{StreamId, ViewId};
use viewforge_events::{
    AggregationError, EventEnvelope, IdPolicy, InlineProjection, ProjectionError, ProjectionRegistry, StreamCursor,
    ViewDocument,
};

use crate::config::{ConfigError, EngineConfig};
use crate::read_model::{ViewStore, ViewWrite, WritePrecondition};
use crate::resolver::{ResolveError, resolve};
use crate::storage::StorageError;

/// Why one projection could not apply one event.
#[derive(Debug, Error)]
pub enum InlineError {
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Order(#[from] AggregationError),

    #[error("projection '{projection}' produced no document for '{event_type}'")]
    NoOutput { projection: String, event_type: String },
}

/// A projection that failed within a unit of work.
#[derive(Debug)]
pub struct ProjectionFailure {
    pub projection: String,
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub sequence_number: u64,
    pub error: InlineError,
}

/// Everything the engine produced for one unit of work.
#[derive(Debug, Default)]
pub struct ProjectedBatch {
    pub writes: Vec<ViewWrite>,
    pub failures: Vec<ProjectionFailure>,
    /// Number of (projection, event) applications that were kept.
    pub applied: usize,
}

#[derive(Debug, Clone)]
struct Staged {
    document: ViewDocument,
    precondition: WritePrecondition,
}

/// Per-projection overlay of staged documents on top of storage.
///
/// Reads see earlier writes of the same unit of work; nothing reaches storage
/// until the session commits.
pub struct WorkingSet<'a, R: ?Sized> {
    store: &'a R,
    staged: HashMap<(String, ViewId), Staged>,
    order: Vec<(String, ViewId)>,
}

impl<'a, R> WorkingSet<'a, R>
where
    R: ViewStore + ?Sized,
{
    pub fn new(store: &'a R) -> Self {
        Self {
            store,
            staged: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Stage `body` as the new content of `(kind, id)`.
    ///
    /// The precondition is fixed by the first write of the unit: the version
    /// read from storage, or "must not exist" for a new record.
    pub fn stage(
        &mut self,
        kind: &str,
        id: ViewId,
        discriminator: Option<String>,
        body: JsonValue,
    ) -> Result<(), StorageError> {
        let key = (kind.to_string(), id);
        if let Some(staged) = self.staged.get_mut(&key) {
            staged.document.body = body;
            return Ok(());
        }

        let (version, precondition, discriminator) = match self.store.load(kind, id)? {
            Some(doc) => (
                doc.version + 1,
                WritePrecondition::Version(doc.version),
                discriminator.or(doc.discriminator),
            ),
            None => (1, WritePrecondition::MustNotExist, discriminator),
        };

        self.staged.insert(
            key.clone(),
            Staged {
                document: ViewDocument {
                    kind: kind.to_string(),
                    id,
                    version,
                    discriminator,
                    body,
                },
                precondition,
            },
        );
        self.order.push(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Staged writes in first-staged order.
    pub fn into_writes(mut self) -> Vec<ViewWrite> {
        self.order
            .iter()
            .filter_map(|key| self.staged.remove(key))
            .map(|s| ViewWrite {
                document: s.document,
                precondition: s.precondition,
            })
            .collect()
    }
}

impl<R> ViewStore for WorkingSet<'_, R>
where
    R: ViewStore + ?Sized,
{
    fn load(&self, kind: &str, id: ViewId) -> Result<Option<ViewDocument>, StorageError> {
        match self.staged.get(&(kind.to_string(), id)) {
            Some(staged) => Ok(Some(staged.document.clone())),
            None => self.store.load(kind, id),
        }
    }

    fn query_one(
        &self,
        kind: &str,
        predicate: &dyn Fn(&ViewDocument) -> bool,
    ) -> Result<Option<ViewDocument>, StorageError> {
        let mut staged_matches = self
            .staged
            .values()
            .map(|s| &s.document)
            .filter(|doc| doc.kind == kind && predicate(doc));
        let staged_hit = staged_matches.next().cloned();
        let staged_count = staged_hit.iter().count() + staged_matches.count();

        // Stored documents that were re-staged are judged by their staged body.
        let stored_hit = self.store.query_one(kind, &|doc: &ViewDocument| {
            !self.staged.contains_key(&(doc.kind.clone(), doc.id)) && predicate(doc)
        })?;

        let count = staged_count + usize::from(stored_hit.is_some());
        if count > 1 {
            return Err(StorageError::MultipleMatches {
                kind: kind.to_string(),
                count,
            });
        }
        Ok(staged_hit.or(stored_hit))
    }

    fn list(&self, kind: &str) -> Result<Vec<ViewDocument>, StorageError> {
        let mut docs: Vec<ViewDocument> = self
            .store
            .list(kind)?
            .into_iter()
            .filter(|doc| !self.staged.contains_key(&(doc.kind.clone(), doc.id)))
            .collect();
        docs.extend(
            self.staged
                .values()
                .filter(|s| s.document.kind == kind)
                .map(|s| s.document.clone()),
        );
        docs.sort_by_key(|d| d.id);
        Ok(docs)
    }
}

/// Applies registered projections to the events of one unit of work.
#[derive(Debug, Clone)]
pub struct InlineProjectionEngine {
    registry: Arc<ProjectionRegistry>,
    config: EngineConfig,
}

impl InlineProjectionEngine {
    /// Fails when `config` does not validate.
    pub fn new(registry: Arc<ProjectionRegistry>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { registry, config })
    }

    /// Engine configured from `VIEWFORGE_*` environment variables.
    pub fn from_env(registry: Arc<ProjectionRegistry>) -> Result<Self, ConfigError> {
        Self::new(registry, EngineConfig::from_env())
    }

    pub fn registry(&self) -> &ProjectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Project `events` (in append order) against `store`.
    ///
    /// Events of one stream must be contiguous and ascending within the unit;
    /// no order is implied across streams.
    #[instrument(skip_all, fields(events = events.len(), projections = self.registry.len()))]
    pub fn project<R>(&self, events: &[EventEnvelope<JsonValue>], store: &R) -> ProjectedBatch
    where
        R: ViewStore + ?Sized,
    {
        let order_errors = check_stream_order(events);
        let mut batch = ProjectedBatch::default();

        for projection in self.registry.projections() {
            self.project_one(projection.as_ref(), events, &order_errors, store, &mut batch);
        }

        debug!(
            writes = batch.writes.len(),
            failures = batch.failures.len(),
            applied = batch.applied,
            "inline projection finished"
        );
        batch
    }

    /// Single-event form of [`InlineProjectionEngine::project`], staging into
    /// a caller-held working set.
    pub fn apply_on_append<R>(
        &self,
        projection: &dyn InlineProjection,
        envelope: &EventEnvelope<JsonValue>,
        working_set: &mut WorkingSet<'_, R>,
    ) -> Result<bool, InlineError>
    where
        R: ViewStore + ?Sized,
    {
        let Some(policy) = projection.policy_for(envelope.event_type()) else {
            return Ok(false);
        };
        apply_event(projection, policy, envelope, working_set)?;
        Ok(true)
    }

    fn project_one<R>(
        &self,
        projection: &dyn InlineProjection,
        events: &[EventEnvelope<JsonValue>],
        order_errors: &HashMap<usize, AggregationError>,
        store: &R,
        batch: &mut ProjectedBatch,
    ) where
        R: ViewStore + ?Sized,
    {
        let mut working_set = WorkingSet::new(store);
        let mut applied = 0usize;

        for (idx, envelope) in events.iter().enumerate() {
            if projection.policy_for(envelope.event_type()).is_none() {
                continue;
            }

            let outcome = match order_errors.get(&idx) {
                Some(err) => Err(InlineError::Order(err.clone())),
                None => self.apply_on_append(projection, envelope, &mut working_set).map(|_| ()),
            };

            match outcome {
                Ok(()) => {
                    applied += 1;
                    debug!(
                        projection = projection.name(),
                        stream_id = %envelope.stream_id(),
                        sequence_number = envelope.sequence_number(),
                        event_type = envelope.event_type(),
                        "event projected"
                    );
                }
                Err(error) => {
                    warn!(
                        projection = projection.name(),
                        stream_id = %envelope.stream_id(),
                        sequence_number = envelope.sequence_number(),
                        event_type = envelope.event_type(),
                        error = %error,
                        "projection failed; its changes in this unit of work are discarded"
                    );
                    batch.failures.push(ProjectionFailure {
                        projection: projection.name().to_string(),
                        event_id: envelope.event_id(),
                        stream_id: envelope.stream_id(),
                        sequence_number: envelope.sequence_number(),
                        error,
                    });
                    if self.config.stop_projection_on_failure {
                        return;
                    }
                }
            }
        }

        batch.applied += applied;
        batch.writes.extend(working_set.into_writes());
    }
}

fn apply_event<R>(
    projection: &dyn InlineProjection,
    policy: &IdPolicy,
    envelope: &EventEnvelope<JsonValue>,
    working_set: &mut WorkingSet<'_, R>,
) -> Result<(), InlineError>
where
    R: ViewStore + ?Sized,
{
    let kind = projection.view_kind();
    let resolution = resolve(envelope, policy, kind, &*working_set)?;
    let current = working_set.load(kind, resolution.id)?;

    let Some(body) = projection.apply(resolution.id, current.as_ref(), envelope)? else {
        return Err(InlineError::NoOutput {
            projection: projection.name().to_string(),
            event_type: envelope.event_type().to_string(),
        });
    };

    let discriminator = match policy {
        IdPolicy::PerStream => None,
        IdPolicy::Shared(rule) => Some(rule.discriminator().to_string()),
    };
    working_set.stage(kind, resolution.id, discriminator, body)?;
    Ok(())
}

/// Map of event index -> ordering error.
///
/// Each stream's first event in the unit sets the cursor; every later event
/// of that stream must follow it directly.
fn check_stream_order(events: &[EventEnvelope<JsonValue>]) -> HashMap<usize, AggregationError> {
    let mut cursors: HashMap<StreamId, StreamCursor> = HashMap::new();
    let mut errors = HashMap::new();

    for (idx, envelope) in events.iter().enumerate() {
        let stream_id = envelope.stream_id();
        let cursor = cursors
            .entry(stream_id)
            .or_insert_with(|| StreamCursor::at(stream_id, envelope.sequence_number().saturating_sub(1)));
        if let Err(err) = cursor.advance(stream_id, envelope.sequence_number()) {
            errors.insert(idx, err);
        }
    }

    errors
}
