//! Inline projection definitions (read model builders).
//!
//! A projection maps event type tags to handlers that mutate one view record
//! per event. Which record is decided by the registration's [`IdPolicy`]:
//!
//! - **per-stream**: the record whose id equals the event's stream id
//! - **shared**: the single record of the projection's kind matching a
//!   predicate, minted when none exists yet
//!
//! Handlers use value-replace semantics: the engine hands over the current
//! document, the projection decodes it, applies the handler to an owned copy
//! and returns the new body. Nothing is aliased or mutated in place.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use viewforge_core::{Aggregate, StreamId, ViewId};

use crate::aggregator::{self, AggregationError};
use crate::registry::{DuplicateHandlerPolicy, RegistryError};
use crate::{Event, EventEnvelope, EventType, View, ViewDocument};

/// Discriminator used by [`IdPolicy::singleton`].
pub const SINGLETON_DISCRIMINATOR: &str = "singleton";

type DocumentPredicate = Arc<dyn Fn(&ViewDocument) -> bool + Send + Sync>;

/// Location rule for a shared view record.
#[derive(Clone)]
pub struct SharedRecord {
    discriminator: String,
    predicate: DocumentPredicate,
}

impl SharedRecord {
    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    /// Whether a persisted document is the record this rule locates.
    pub fn matches(&self, document: &ViewDocument) -> bool {
        document.discriminator.as_deref() == Some(self.discriminator.as_str()) && (self.predicate)(document)
    }
}

impl core::fmt::Debug for SharedRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRecord")
            .field("discriminator", &self.discriminator)
            .finish_non_exhaustive()
    }
}

/// How the target record id is chosen for an event.
#[derive(Debug, Clone)]
pub enum IdPolicy {
    PerStream,
    Shared(SharedRecord),
}

impl IdPolicy {
    /// "The one existing record of this kind, if any."
    pub fn singleton() -> Self {
        IdPolicy::Shared(SharedRecord {
            discriminator: SINGLETON_DISCRIMINATOR.to_string(),
            predicate: Arc::new(|_| true),
        })
    }

    /// Shared record located by a typed predicate.
    ///
    /// Documents that fail to decode as `V` never match.
    pub fn shared_by<V, F>(discriminator: impl Into<String>, predicate: F) -> Self
    where
        V: View,
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        IdPolicy::Shared(SharedRecord {
            discriminator: discriminator.into(),
            predicate: Arc::new(move |doc| match doc.decode::<V>() {
                Ok(view) => predicate(&view),
                Err(err) => {
                    warn!(kind = V::KIND, view_id = %doc.id, error = %err, "undecodable view document ignored by predicate");
                    false
                }
            }),
        })
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, IdPolicy::Shared(_))
    }
}

/// Failure of one projection while applying one event.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to decode '{event_type}' payload: {reason}")]
    Decode { event_type: String, reason: String },

    #[error("failed to decode stored {kind} view {id}: {reason}")]
    ViewDecode { kind: &'static str, id: ViewId, reason: String },

    #[error("failed to encode {kind} view: {reason}")]
    Encode { kind: &'static str, reason: String },

    #[error("handler changed view id from {expected} to {found}")]
    IdChanged { expected: ViewId, found: ViewId },

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Aggregate(#[from] AggregationError),
}

/// Type-erased projection as seen by the inline engine.
pub trait InlineProjection: Send + Sync {
    /// Unique name (used in logs, failures and rebuilds).
    fn name(&self) -> &str;

    /// Kind of the view documents this projection writes.
    fn view_kind(&self) -> &'static str;

    /// Tags this projection has handlers for.
    fn event_types(&self) -> Vec<&str>;

    /// Id policy for `event_type`, or `None` when no handler is registered.
    fn policy_for(&self, event_type: &str) -> Option<&IdPolicy>;

    /// Apply one event to `current` (or to `empty(id)` when absent).
    ///
    /// Returns the new document body, or `Ok(None)` when the tag has no
    /// handler.
    fn apply(
        &self,
        id: ViewId,
        current: Option<&ViewDocument>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<JsonValue>, ProjectionError>;
}

type Handler<V> = Box<dyn Fn(&mut V, &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> + Send + Sync>;

struct Registration<V> {
    policy: IdPolicy,
    handler: Handler<V>,
}

/// Projection of events onto records of view type `V`.
pub struct ViewProjection<V: View> {
    name: String,
    registrations: HashMap<&'static str, Registration<V>>,
}

impl<V: View> ViewProjection<V> {
    pub fn builder(name: impl Into<String>) -> ViewProjectionBuilder<V> {
        ViewProjectionBuilder {
            name: name.into(),
            on_duplicate: DuplicateHandlerPolicy::default(),
            registrations: HashMap::new(),
            duplicate: None,
        }
    }

    fn load(&self, id: ViewId, current: Option<&ViewDocument>) -> Result<V, ProjectionError> {
        match current {
            Some(doc) => doc.decode::<V>().map_err(|e| ProjectionError::ViewDecode {
                kind: V::KIND,
                id: doc.id,
                reason: e.to_string(),
            }),
            None => Ok(V::empty(id)),
        }
    }
}

impl<V: View> core::fmt::Debug for ViewProjection<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut tags: Vec<_> = self.registrations.keys().collect();
        tags.sort();
        f.debug_struct("ViewProjection")
            .field("name", &self.name)
            .field("kind", &V::KIND)
            .field("event_types", &tags)
            .finish()
    }
}

impl<V: View> InlineProjection for ViewProjection<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn view_kind(&self) -> &'static str {
        V::KIND
    }

    fn event_types(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.registrations.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    fn policy_for(&self, event_type: &str) -> Option<&IdPolicy> {
        self.registrations.get(event_type).map(|r| &r.policy)
    }

    fn apply(
        &self,
        id: ViewId,
        current: Option<&ViewDocument>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<JsonValue>, ProjectionError> {
        let Some(registration) = self.registrations.get(envelope.event_type()) else {
            return Ok(None);
        };

        let mut view = self.load(id, current)?;
        (registration.handler)(&mut view, envelope)?;

        if view.id() != id {
            return Err(ProjectionError::IdChanged {
                expected: id,
                found: view.id(),
            });
        }

        serde_json::to_value(&view)
            .map(Some)
            .map_err(|e| ProjectionError::Encode {
                kind: V::KIND,
                reason: e.to_string(),
            })
    }
}

/// Builder for [`ViewProjection`]; registration happens once, before any
/// event is processed.
pub struct ViewProjectionBuilder<V: View> {
    name: String,
    on_duplicate: DuplicateHandlerPolicy,
    registrations: HashMap<&'static str, Registration<V>>,
    duplicate: Option<&'static str>,
}

impl<V: View> ViewProjectionBuilder<V> {
    /// What to do when a tag is registered twice (default: reject at build).
    pub fn on_duplicate(mut self, policy: DuplicateHandlerPolicy) -> Self {
        self.on_duplicate = policy;
        self
    }

    /// Register `handler` for the payload type `S`.
    pub fn project<S, F>(mut self, policy: IdPolicy, handler: F) -> Self
    where
        S: EventType,
        F: Fn(&mut V, &EventEnvelope<S>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let erased: Handler<V> = Box::new(move |view, envelope| {
            let payload = crate::event::decode_payload::<S>(envelope.payload()).map_err(|e| ProjectionError::Decode {
                event_type: S::EVENT_TYPE.to_string(),
                reason: e.to_string(),
            })?;
            handler(view, &envelope.with_payload(payload)).map_err(ProjectionError::Handler)
        });

        let replaced = self
            .registrations
            .insert(S::EVENT_TYPE, Registration { policy, handler: erased })
            .is_some();

        if replaced {
            match self.on_duplicate {
                DuplicateHandlerPolicy::Reject => {
                    self.duplicate.get_or_insert(S::EVENT_TYPE);
                }
                DuplicateHandlerPolicy::Replace => {
                    warn!(
                        projection = %self.name,
                        event_type = S::EVENT_TYPE,
                        "handler re-registered; previous handler replaced"
                    );
                }
            }
        }

        self
    }

    pub fn build(self) -> Result<ViewProjection<V>, RegistryError> {
        if let Some(event_type) = self.duplicate {
            return Err(RegistryError::DuplicateHandler {
                projection: self.name,
                event_type: event_type.to_string(),
            });
        }
        if self.registrations.is_empty() {
            return Err(RegistryError::EmptyProjection(self.name));
        }

        Ok(ViewProjection {
            name: self.name,
            registrations: self.registrations,
        })
    }
}

/// Inline aggregation: keep an aggregate persisted as a per-stream view.
///
/// The handler for every tag of `A::Event` is `A::apply` itself, so the
/// persisted record and a live fold of the same stream cannot drift apart.
pub struct AggregateProjection<A> {
    name: String,
    policy: IdPolicy,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> AggregateProjection<A>
where
    A: Aggregate<Id = StreamId> + View,
    A::Event: Event,
{
    pub fn new() -> Self {
        Self::named(format!("{}.inline", A::KIND))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: IdPolicy::PerStream,
            _aggregate: PhantomData,
        }
    }
}

impl<A> Default for AggregateProjection<A>
where
    A: Aggregate<Id = StreamId> + View,
    A::Event: Event,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> core::fmt::Debug for AggregateProjection<A>
where
    A: View,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AggregateProjection")
            .field("name", &self.name)
            .field("kind", &A::KIND)
            .finish()
    }
}

impl<A> InlineProjection for AggregateProjection<A>
where
    A: Aggregate<Id = StreamId> + View,
    A::Event: Event,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn view_kind(&self) -> &'static str {
        A::KIND
    }

    fn event_types(&self) -> Vec<&str> {
        A::Event::EVENT_TYPES.to_vec()
    }

    fn policy_for(&self, event_type: &str) -> Option<&IdPolicy> {
        A::Event::handles(event_type).then_some(&self.policy)
    }

    fn apply(
        &self,
        id: ViewId,
        current: Option<&ViewDocument>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<JsonValue>, ProjectionError> {
        let Some(event) = aggregator::decode::<A::Event>(envelope)? else {
            return Ok(None);
        };

        let mut state = match current {
            Some(doc) => doc.decode::<A>().map_err(|e| ProjectionError::ViewDecode {
                kind: A::KIND,
                id: doc.id,
                reason: e.to_string(),
            })?,
            None => <A as Aggregate>::empty(envelope.stream_id()),
        };

        aggregator::apply_event(&mut state, &event, envelope.sequence_number())?;

        let found = View::id(&state);
        if found != id {
            return Err(ProjectionError::IdChanged { expected: id, found });
        }

        serde_json::to_value(&state)
            .map(Some)
            .map_err(|e| ProjectionError::Encode {
                kind: A::KIND,
                reason: e.to_string(),
            })
    }
}
