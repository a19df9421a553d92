//! Append-only event log boundary.
//!
//! The engine only reads committed streams and appends new events; it never
//! rewrites history.

pub mod r#trait;

pub use r#trait::{EventStore, StoredEvent, UncommittedEvent};
