use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use viewforge_core::{Aggregate, AggregateRoot, DomainError, DomainResult, StreamId, ViewId};
use viewforge_events::event::decode_payload;
use viewforge_events::{Event, EventType, View};

/// Issue identifier (unique across all issue lists).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub Uuid);

impl IssueId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for IssueId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<StreamId> for IssueId {
    fn from(value: StreamId) -> Self {
        Self(*value.as_uuid())
    }
}

impl core::fmt::Display for IssueId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One entry of an issue list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: IssueId,
    pub description: String,
}

/// Aggregate root: IssuesList.
///
/// Also a per-stream view, so it can be kept inline by an
/// `AggregateProjection` and compared against the live fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuesList {
    id: StreamId,
    items: Vec<Issue>,
    version: u64,
}

impl IssuesList {
    pub fn items(&self) -> &[Issue] {
        &self.items
    }

    pub fn get(&self, issue_id: IssueId) -> Option<&Issue> {
        self.items.iter().find(|i| i.issue_id == issue_id)
    }

    pub fn contains(&self, issue_id: IssueId) -> bool {
        self.get(issue_id).is_some()
    }
}

impl AggregateRoot for IssuesList {
    type Id = StreamId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateIssue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIssue {
    pub issue_id: IssueId,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateIssue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIssue {
    pub issue_id: IssueId,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueCommand {
    CreateIssue(CreateIssue),
    UpdateIssue(UpdateIssue),
}

/// Event: IssueCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCreated {
    pub issue_id: IssueId,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: IssueUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueUpdated {
    pub issue_id: IssueId,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

impl EventType for IssueCreated {
    const EVENT_TYPE: &'static str = "issues.issue.created";
}

impl EventType for IssueUpdated {
    const EVENT_TYPE: &'static str = "issues.issue.updated";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueEvent {
    IssueCreated(IssueCreated),
    IssueUpdated(IssueUpdated),
}

impl IssueEvent {
    pub fn created(issue_id: IssueId, description: impl Into<String>) -> Self {
        IssueEvent::IssueCreated(IssueCreated {
            issue_id,
            description: description.into(),
            occurred_at: Utc::now(),
        })
    }

    pub fn updated(issue_id: IssueId, description: impl Into<String>) -> Self {
        IssueEvent::IssueUpdated(IssueUpdated {
            issue_id,
            description: description.into(),
            occurred_at: Utc::now(),
        })
    }
}

impl Event for IssueEvent {
    const EVENT_TYPES: &'static [&'static str] = &[IssueCreated::EVENT_TYPE, IssueUpdated::EVENT_TYPE];

    fn event_type(&self) -> &'static str {
        match self {
            IssueEvent::IssueCreated(_) => IssueCreated::EVENT_TYPE,
            IssueEvent::IssueUpdated(_) => IssueUpdated::EVENT_TYPE,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            IssueEvent::IssueCreated(e) => e.occurred_at,
            IssueEvent::IssueUpdated(e) => e.occurred_at,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            IssueEvent::IssueCreated(e) => serde_json::to_value(e),
            IssueEvent::IssueUpdated(e) => serde_json::to_value(e),
        }
    }

    fn from_payload(event_type: &str, payload: &JsonValue) -> Result<Option<Self>, serde_json::Error> {
        if event_type == IssueCreated::EVENT_TYPE {
            Ok(Some(IssueEvent::IssueCreated(decode_payload(payload)?)))
        } else if event_type == IssueUpdated::EVENT_TYPE {
            Ok(Some(IssueEvent::IssueUpdated(decode_payload(payload)?)))
        } else {
            Ok(None)
        }
    }
}

impl Aggregate for IssuesList {
    type Command = IssueCommand;
    type Event = IssueEvent;
    type Error = DomainError;

    fn empty(id: StreamId) -> Self {
        Self {
            id,
            items: Vec::new(),
            version: 0,
        }
    }

    fn apply(&mut self, event: &Self::Event) -> DomainResult<()> {
        match event {
            IssueEvent::IssueCreated(e) => {
                if self.contains(e.issue_id) {
                    return Err(DomainError::invariant(format!("issue '{}' created twice", e.issue_id)));
                }
                self.items.push(Issue {
                    issue_id: e.issue_id,
                    description: e.description.clone(),
                });
            }
            IssueEvent::IssueUpdated(e) => {
                let issue = self
                    .items
                    .iter_mut()
                    .find(|i| i.issue_id == e.issue_id)
                    .ok_or_else(|| DomainError::record_not_found("issue", e.issue_id))?;
                issue.description = e.description.clone();
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
        Ok(())
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            IssueCommand::CreateIssue(cmd) => self.handle_create(cmd),
            IssueCommand::UpdateIssue(cmd) => self.handle_update(cmd),
        }
    }
}

impl IssuesList {
    fn handle_create(&self, cmd: &CreateIssue) -> Result<Vec<IssueEvent>, DomainError> {
        if self.contains(cmd.issue_id) {
            return Err(DomainError::conflict("issue already exists"));
        }
        if cmd.description.trim().is_empty() {
            return Err(DomainError::validation("description cannot be empty"));
        }
        Ok(vec![IssueEvent::IssueCreated(IssueCreated {
            issue_id: cmd.issue_id,
            description: cmd.description.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateIssue) -> Result<Vec<IssueEvent>, DomainError> {
        let Some(current) = self.get(cmd.issue_id) else {
            return Err(DomainError::record_not_found("issue", cmd.issue_id));
        };
        if cmd.description.trim().is_empty() {
            return Err(DomainError::validation("description cannot be empty"));
        }
        if current.description == cmd.description {
            return Ok(vec![]);
        }
        Ok(vec![IssueEvent::IssueUpdated(IssueUpdated {
            issue_id: cmd.issue_id,
            description: cmd.description.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

impl View for IssuesList {
    const KIND: &'static str = "issues_list";

    fn empty(id: ViewId) -> Self {
        <Self as Aggregate>::empty(StreamId::from_uuid(*id.as_uuid()))
    }

    fn id(&self) -> ViewId {
        ViewId::from(self.id)
    }
}
