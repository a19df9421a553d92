use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use viewforge_core::ViewId;
use viewforge_events::{DuplicateHandlerPolicy, IdPolicy, RegistryError, View, ViewProjection};
use viewforge_issues::{IssueCreated, IssueId, IssueUpdated};

pub const NAME: &str = "issue_descriptions";

/// Queryable read model: the current description of every issue, across all
/// issue lists, in one shared record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDescriptionView {
    pub id: ViewId,
    pub descriptions: BTreeMap<IssueId, String>,
}

impl IssueDescriptionView {
    pub fn description(&self, issue_id: IssueId) -> Option<&str> {
        self.descriptions.get(&issue_id).map(String::as_str)
    }
}

impl View for IssueDescriptionView {
    const KIND: &'static str = "issue_descriptions";

    fn empty(id: ViewId) -> Self {
        Self {
            id,
            descriptions: BTreeMap::new(),
        }
    }

    fn id(&self) -> ViewId {
        self.id
    }
}

pub fn issue_descriptions_projection(
    on_duplicate: DuplicateHandlerPolicy,
) -> Result<ViewProjection<IssueDescriptionView>, RegistryError> {
    ViewProjection::<IssueDescriptionView>::builder(NAME)
        .on_duplicate(on_duplicate)
        .project::<IssueCreated, _>(IdPolicy::singleton(), |view, env| {
            let created = env.payload();
            anyhow::ensure!(
                !view.descriptions.contains_key(&created.issue_id),
                "issue '{}' is already described",
                created.issue_id
            );
            view.descriptions.insert(created.issue_id, created.description.clone());
            Ok(())
        })
        .project::<IssueUpdated, _>(IdPolicy::singleton(), |view, env| {
            let updated = env.payload();
            view.descriptions.insert(updated.issue_id, updated.description.clone());
            Ok(())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use viewforge_core::StreamId;
    use viewforge_events::{Event, EventEnvelope, InlineProjection, ViewDocument};
    use viewforge_issues::IssueEvent;

    fn envelope(stream_id: StreamId, seq: u64, event: &IssueEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            stream_id,
            "issues_list",
            seq,
            event.event_type(),
            event.to_payload().unwrap(),
        )
    }

    fn apply(
        projection: &ViewProjection<IssueDescriptionView>,
        current: Option<IssueDescriptionView>,
        env: &EventEnvelope<JsonValue>,
    ) -> anyhow::Result<IssueDescriptionView> {
        let id = current.as_ref().map(|v| v.id).unwrap_or_else(ViewId::new);
        let doc = current
            .map(|v| ViewDocument::encode(&v, 1, Some("singleton".to_string())))
            .transpose()?;
        let body = projection.apply(id, doc.as_ref(), env)?.expect("handled");
        Ok(serde_json::from_value(body)?)
    }

    #[test]
    fn created_inserts_and_updated_overwrites() {
        let projection = issue_descriptions_projection(DuplicateHandlerPolicy::Reject).unwrap();
        let s1 = StreamId::new();
        let issue_id = IssueId::from(s1);

        let view = apply(&projection, None, &envelope(s1, 1, &IssueEvent::created(issue_id, "X1"))).unwrap();
        let view = apply(&projection, Some(view), &envelope(s1, 2, &IssueEvent::updated(issue_id, "X1-new"))).unwrap();
        assert_eq!(view.description(issue_id), Some("X1-new"));
    }

    #[test]
    fn second_create_for_same_issue_fails() {
        let projection = issue_descriptions_projection(DuplicateHandlerPolicy::Reject).unwrap();
        let s1 = StreamId::new();
        let issue_id = IssueId::from(s1);

        let view = apply(&projection, None, &envelope(s1, 1, &IssueEvent::created(issue_id, "X1"))).unwrap();
        let err = apply(&projection, Some(view), &envelope(s1, 2, &IssueEvent::created(issue_id, "X1"))).unwrap_err();
        assert!(err.to_string().contains("already described"));
    }

    #[test]
    fn both_handlers_use_the_singleton_policy() {
        let projection = issue_descriptions_projection(DuplicateHandlerPolicy::Reject).unwrap();
        assert_eq!(projection.event_types(), vec!["issues.issue.created", "issues.issue.updated"]);
        for tag in projection.event_types() {
            assert!(projection.policy_for(tag).unwrap().is_shared());
        }
    }
}
