//! View records (read models) and their persisted document form.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use viewforge_core::ViewId;

/// A materialized read model maintained by inline projection.
///
/// Views are **disposable**: they can be dropped and rebuilt from events.
pub trait View: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Storage kind; one projection owns all documents of a kind.
    const KIND: &'static str;

    /// Zero-value record for a freshly resolved id.
    fn empty(id: ViewId) -> Self;

    fn id(&self) -> ViewId;
}

/// Persisted form of a view record.
///
/// - `version` counts committed writes (optimistic concurrency on documents)
/// - `discriminator` is set for shared records; storage keeps
///   `(kind, discriminator)` unique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDocument {
    pub kind: String,
    pub id: ViewId,
    pub version: u64,
    pub discriminator: Option<String>,
    pub body: JsonValue,
}

impl ViewDocument {
    pub fn decode<V: View>(&self) -> Result<V, serde_json::Error> {
        V::deserialize(&self.body)
    }

    pub fn encode<V: View>(view: &V, version: u64, discriminator: Option<String>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: V::KIND.to_string(),
            id: view.id(),
            version,
            discriminator,
            body: serde_json::to_value(view)?,
        })
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}
