//! `viewforge-core`: event-sourcing foundation building blocks.
//!
//! This crate contains **pure** primitives (no storage, no projection plumbing).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{StreamId, ViewId};
