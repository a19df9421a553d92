//! Infrastructure layer: storage boundary, inline projection engine, unit of
//! work, live aggregation and command dispatch.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod inline;
pub mod live;
pub mod projections;
pub mod read_model;
pub mod rebuild;
pub mod resolver;
pub mod session;
pub mod storage;


pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use config::{ConfigError, EngineConfig};
pub use event_store::{EventStore, StoredEvent, UncommittedEvent};
pub use inline::{InlineError, InlineProjectionEngine, ProjectedBatch, ProjectionFailure, WorkingSet};
pub use live::{LiveAggregator, LiveError};
pub use read_model::{ViewStore, ViewWrite, WritePrecondition, load_view};
pub use rebuild::{RebuildError, RebuildReport, rebuild_projection};
pub use resolver::{Resolution, ResolveError, resolve};
pub use session::{CommitOutcome, ProjectionSession, SessionError};
pub use storage::{CommitBatch, DocumentStore, InMemoryStore, StorageError, StreamAppend, TransactionalStore};
