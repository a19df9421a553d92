//! Events, views and projection definitions.
//!
//! Everything here is pure computation over already-fetched data: folding a
//! stream into an aggregate, and describing how events mutate view records.
//! Storage and the append-time orchestration live in `viewforge-infra`.

pub mod aggregator;
pub mod envelope;
pub mod event;
pub mod projection;
pub mod registry;
pub mod view;

pub use aggregator::{AggregationError, StreamCursor, aggregate, aggregate_typed};
pub use envelope::EventEnvelope;
pub use event::{Event, EventType};
pub use projection::{
    AggregateProjection, IdPolicy, InlineProjection, ProjectionError, SharedRecord, ViewProjection,
    ViewProjectionBuilder,
};
pub use registry::{
    DuplicateHandlerPolicy, ProjectionRegistry, ProjectionRegistryBuilder, RegistryError,
};
pub use view::{View, ViewDocument};
