//! Projection implementations (read model builders).
//!
//! All projections here are inline: they run inside the append's unit of
//! work and are rebuildable from the event log with
//! [`crate::rebuild::rebuild_projection`].

pub mod issue_descriptions;
pub mod issues_list;

pub use issue_descriptions::{IssueDescriptionView, issue_descriptions_projection};
pub use issues_list::issues_list_projection;

use viewforge_events::{ProjectionRegistry, RegistryError};

use crate::config::EngineConfig;

/// Registry with every projection of the issues domain, in evaluation order.
pub fn default_registry(config: &EngineConfig) -> Result<ProjectionRegistry, RegistryError> {
    ProjectionRegistry::builder()
        .with(issues_list_projection())
        .with(issue_descriptions_projection(config.duplicate_handlers)?)
        .build()
}
