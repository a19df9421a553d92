//! Projection registry: the frozen set of inline projections.
//!
//! Assembled once at configuration time and handed to the engine explicitly;
//! there is no ambient/static registry. After `build()` nothing can be added,
//! replaced or removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::InlineProjection;

/// Behaviour when the same event type is registered twice on one projection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateHandlerPolicy {
    /// Fail `build()` with [`RegistryError::DuplicateHandler`].
    #[default]
    Reject,
    /// Last registration wins; a warning is logged.
    Replace,
}

/// Configuration errors raised while assembling projections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("projection '{projection}' registers '{event_type}' more than once")]
    DuplicateHandler { projection: String, event_type: String },

    #[error("projection '{0}' registered twice")]
    DuplicateProjection(String),

    #[error("view kind '{kind}' is written by both '{first}' and '{second}'")]
    DuplicateViewKind { kind: String, first: String, second: String },

    #[error("projection '{0}' has no handlers")]
    EmptyProjection(String),
}

/// Immutable set of inline projections, evaluated in registration order.
#[derive(Clone, Default)]
pub struct ProjectionRegistry {
    projections: Vec<Arc<dyn InlineProjection>>,
}

impl ProjectionRegistry {
    pub fn builder() -> ProjectionRegistryBuilder {
        ProjectionRegistryBuilder::default()
    }

    pub fn projections(&self) -> &[Arc<dyn InlineProjection>] {
        &self.projections
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn InlineProjection>> {
        self.projections.iter().find(|p| p.name() == name)
    }

    /// Whether any projection has a handler for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.projections.iter().any(|p| p.policy_for(event_type).is_some())
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }
}

impl core::fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.projections.iter().map(|p| (p.name(), p.view_kind())))
            .finish()
    }
}

#[derive(Default)]
pub struct ProjectionRegistryBuilder {
    projections: Vec<Arc<dyn InlineProjection>>,
}

impl ProjectionRegistryBuilder {
    pub fn with<P>(mut self, projection: P) -> Self
    where
        P: InlineProjection + 'static,
    {
        self.projections.push(Arc::new(projection));
        self
    }

    /// Register a projection already shared with another registry.
    pub fn with_shared(mut self, projection: Arc<dyn InlineProjection>) -> Self {
        self.projections.push(projection);
        self
    }

    /// Freeze the registry.
    ///
    /// Rejects duplicate projection names and two projections writing the same
    /// view kind (their staged writes could not be isolated from each other).
    pub fn build(self) -> Result<ProjectionRegistry, RegistryError> {
        let mut names: HashSet<&str> = HashSet::new();
        let mut kinds: HashMap<&'static str, &str> = HashMap::new();

        for projection in &self.projections {
            if !names.insert(projection.name()) {
                return Err(RegistryError::DuplicateProjection(projection.name().to_string()));
            }
            if let Some(first) = kinds.insert(projection.view_kind(), projection.name()) {
                return Err(RegistryError::DuplicateViewKind {
                    kind: projection.view_kind().to_string(),
                    first: first.to_string(),
                    second: projection.name().to_string(),
                });
            }
        }

        Ok(ProjectionRegistry {
            projections: self.projections,
        })
    }
}
