//! Issues domain module (event-sourced).
//!
//! An issue list is a single stream whose events add issues and rewrite their
//! descriptions. Pure domain logic: no IO, no storage.

pub mod issue;

pub use issue::{
    CreateIssue, Issue, IssueCommand, IssueCreated, IssueEvent, IssueId, IssueUpdated, IssuesList, UpdateIssue,
};
