//! View (read model) storage boundary.

pub mod view_store;

pub use view_store::{ViewStore, ViewWrite, WritePrecondition, load_view};
