use std::sync::Arc;

use viewforge_core::ViewId;
use viewforge_events::{View, ViewDocument};

use crate::storage::StorageError;

/// Read access to persisted view documents.
///
/// Views are disposable: everything here can be rebuilt from the event log.
pub trait ViewStore: Send + Sync {
    fn load(&self, kind: &str, id: ViewId) -> Result<Option<ViewDocument>, StorageError>;

    /// The single document of `kind` matching `predicate`.
    ///
    /// More than one match is [`StorageError::MultipleMatches`].
    fn query_one(
        &self,
        kind: &str,
        predicate: &dyn Fn(&ViewDocument) -> bool,
    ) -> Result<Option<ViewDocument>, StorageError>;

    fn list(&self, kind: &str) -> Result<Vec<ViewDocument>, StorageError>;
}

impl<S> ViewStore for Arc<S>
where
    S: ViewStore + ?Sized,
{
    fn load(&self, kind: &str, id: ViewId) -> Result<Option<ViewDocument>, StorageError> {
        (**self).load(kind, id)
    }

    fn query_one(
        &self,
        kind: &str,
        predicate: &dyn Fn(&ViewDocument) -> bool,
    ) -> Result<Option<ViewDocument>, StorageError> {
        (**self).query_one(kind, predicate)
    }

    fn list(&self, kind: &str) -> Result<Vec<ViewDocument>, StorageError> {
        (**self).list(kind)
    }
}

/// Load and decode a typed view.
pub fn load_view<V, S>(store: &S, id: ViewId) -> Result<Option<V>, StorageError>
where
    V: View,
    S: ViewStore + ?Sized,
{
    store
        .load(V::KIND, id)?
        .map(|doc| {
            doc.decode::<V>()
                .map_err(|e| StorageError::Serialization(format!("{} view {id}: {e}", V::KIND)))
        })
        .transpose()
}

/// Expected state of a document at commit time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The document must not exist yet (created in this unit of work).
    MustNotExist,
    /// The document must still be at this version.
    Version(u64),
}

impl WritePrecondition {
    pub fn holds(self, current: Option<&ViewDocument>) -> bool {
        match (self, current) {
            (WritePrecondition::MustNotExist, None) => true,
            (WritePrecondition::Version(v), Some(doc)) => doc.version == v,
            _ => false,
        }
    }
}

/// A staged document upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewWrite {
    pub document: ViewDocument,
    pub precondition: WritePrecondition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(version: u64) -> ViewDocument {
        ViewDocument {
            kind: "k".to_string(),
            id: ViewId::new(),
            version,
            discriminator: None,
            body: json!({}),
        }
    }

    #[test]
    fn preconditions() {
        assert!(WritePrecondition::MustNotExist.holds(None));
        assert!(!WritePrecondition::MustNotExist.holds(Some(&doc(1))));
        assert!(WritePrecondition::Version(2).holds(Some(&doc(2))));
        assert!(!WritePrecondition::Version(2).holds(Some(&doc(3))));
        assert!(!WritePrecondition::Version(2).holds(None));
    }
}
