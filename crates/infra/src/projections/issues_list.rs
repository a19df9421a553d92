//! Per-stream issue list view, maintained by inline aggregation.
//!
//! The persisted record is exactly what `LiveAggregator::aggregate_stream`
//! returns for the same stream.

use viewforge_events::AggregateProjection;
use viewforge_issues::IssuesList;

pub const NAME: &str = "issues_list.inline";

pub fn issues_list_projection() -> AggregateProjection<IssuesList> {
    AggregateProjection::named(NAME)
}
