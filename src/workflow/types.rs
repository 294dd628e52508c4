/// Core workflow type definitions
///
/// Defines workflow definitions (steps, triggers), running instances and their
/// per-step execution records. Everything here is serialized as camelCase JSON,
/// both for persistence and for the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A workflow definition: an ordered step graph plus trigger bindings
///
/// Definitions are versioned. Running instances pin the version they were
/// created from, so an update never changes the graph under a live instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-article-review")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Content type this workflow governs, used for default-workflow lookup
    #[serde(default)]
    pub content_type_id: Option<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub start_step_id: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "first_version")]
    pub version: u32,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn first_version() -> u32 {
    1
}

impl Workflow {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Whether this workflow should be instantiated for the given trigger event
    pub fn matches_trigger(
        &self,
        event_type: &str,
        content_type_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> bool {
        if !self.is_active() {
            return false;
        }
        if let (Some(own), Some(requested)) = (self.tenant_id.as_deref(), tenant_id) {
            if own != requested {
                return false;
            }
        }
        self.triggers.iter().any(|t| {
            t.event_type == event_type
                && match (t.content_type_id.as_deref(), content_type_id) {
                    (None, _) => true,
                    (Some(filter), Some(actual)) => filter == actual,
                    (Some(_), None) => false,
                }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Inactive,
    Archived,
}

/// A single step in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique step identifier within the workflow (e.g., "legal-review")
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The type of step which determines handler behavior
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Type-specific configuration, validated at definition time
    #[serde(default)]
    pub config: Value,
    /// Candidate successor step ids
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// Unique ordering key within the workflow
    pub order: i32,
    /// Editor canvas position; never evaluated
    #[serde(default)]
    pub position: Position,
}

/// Available step types
///
/// - Approval: waits for a human to complete or reject
///   Expected config: { "approvers": ["editor"] }
/// - Notification: sends a message then advances
///   Expected config: { "recipients": ["legal@corp"], "message": "..." }
/// - Condition: routes on a boolean expression over instance data
///   Expected config: { "condition": "data.amount > 100", "trueStepId": "a", "falseStepId": "b" }
/// - Action: runs a registered action
///   Expected config: { "action": "publish", "params": {...} }
/// - Delay: parks the instance on the scheduler
///   Expected config: { "duration": 1, "unit": "minutes" }
/// - Fork / Join: reserved, rejected by validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Approval,
    Notification,
    Condition,
    Action,
    Delay,
    Fork,
    Join,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Binding from a domain event type to this workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTrigger {
    #[serde(default)]
    pub id: String,
    /// Event type that starts the workflow (e.g., "content:published")
    pub event_type: String,
    /// Optional content-type filter
    #[serde(default)]
    pub content_type_id: Option<String>,
}

/// One execution run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub tenant_id: Option<String>,
    pub status: InstanceStatus,
    pub current_step_id: Option<String>,
    pub content_id: Option<String>,
    pub media_id: Option<String>,
    pub created_by: Option<String>,
    /// Opaque payload visible to condition and action handlers
    pub data: Value,
    /// Terminal payload: completion info, rejection reason or error
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Suspended,
}

impl InstanceStatus {
    /// States in which steps may be executed, completed or rejected
    pub const ACTIVE: [InstanceStatus; 2] = [InstanceStatus::Pending, InstanceStatus::Running];

    /// States from which an instance may be cancelled
    pub const CANCELLABLE: [InstanceStatus; 3] = [
        InstanceStatus::Pending,
        InstanceStatus::Running,
        InstanceStatus::Suspended,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Cancelled => "CANCELLED",
            InstanceStatus::Suspended => "SUSPENDED",
        }
    }
}

/// Append-only record of one visit of an instance to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceStep {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub assigned_to: Option<String>,
    pub result: Option<Value>,
    pub notes: Option<String>,
    pub completed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstanceStep {
    pub fn pending(instance_id: Uuid, step_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            assigned_to: None,
            result: None,
            notes: None,
            completed_by: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn apply(&mut self, patch: &InstanceStepPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(assigned_to) = &patch.assigned_to {
            self.assigned_to = Some(assigned_to.clone());
        }
        if let Some(result) = &patch.result {
            self.result = Some(result.clone());
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(completed_by) = &patch.completed_by {
            self.completed_by = Some(completed_by.clone());
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
    Skipped,
    Failed,
}

/// Partial update of an instance; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    /// `Some(None)` clears the current step
    pub current_step_id: Option<Option<String>>,
    pub result: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstancePatch {
    /// Patch for a terminal transition: clears the current step, stamps completion
    pub fn terminal(status: InstanceStatus, result: Value) -> Self {
        Self {
            status: Some(status),
            current_step_id: Some(None),
            result: Some(result),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn apply(&self, instance: &mut WorkflowInstance) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(current) = &self.current_step_id {
            instance.current_step_id = current.clone();
        }
        if let Some(result) = &self.result {
            instance.result = Some(result.clone());
        }
        if let Some(started_at) = self.started_at {
            instance.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            instance.completed_at = Some(completed_at);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceStepPatch {
    pub status: Option<StepStatus>,
    pub assigned_to: Option<String>,
    pub result: Option<Value>,
    pub notes: Option<String>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Precondition for an atomic instance transition
///
/// The transition is applied only if the stored instance is in one of
/// `statuses` and, when `current_step_id` is set, still sits on that step.
#[derive(Debug, Clone)]
pub struct TransitionGuard {
    pub statuses: Vec<InstanceStatus>,
    pub current_step_id: Option<String>,
}

impl TransitionGuard {
    pub fn on_step(statuses: &[InstanceStatus], step_id: &str) -> Self {
        Self {
            statuses: statuses.to_vec(),
            current_step_id: Some(step_id.to_string()),
        }
    }

    pub fn in_status(statuses: &[InstanceStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            current_step_id: None,
        }
    }

    pub fn admits(&self, instance: &WorkflowInstance) -> bool {
        self.statuses.contains(&instance.status)
            && match &self.current_step_id {
                Some(step) => instance.current_step_id.as_deref() == Some(step.as_str()),
                None => true,
            }
    }
}

/// Everything a single atomic instance transition writes
#[derive(Debug, Clone, Default)]
pub struct InstanceTransition {
    pub patch: InstancePatch,
    /// Update of the most recent record for the named step
    pub step_update: Option<(String, InstanceStepPatch)>,
    /// New record appended when the instance enters a step
    pub new_step: Option<WorkflowInstanceStep>,
}

/// Context captured when a workflow is instantiated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// A domain event that may start workflows through their triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub event_type: String,
    #[serde(default)]
    pub content_type_id: Option<String>,
    #[serde(flatten)]
    pub context: TriggerContext,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(status: InstanceStatus, step: Option<&str>) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            workflow_version: 1,
            tenant_id: None,
            status,
            current_step_id: step.map(str::to_string),
            content_id: None,
            media_id: None,
            created_by: None,
            data: json!({}),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn workflow_deserializes_from_camel_case_json() {
        let wf: Workflow = serde_json::from_value(json!({
            "id": "wf-review",
            "name": "Review",
            "status": "ACTIVE",
            "startStepId": "a",
            "steps": [
                {"id": "a", "type": "APPROVAL", "config": {"approvers": ["ed"]}, "nextSteps": [], "order": 1}
            ],
            "triggers": [{"eventType": "content:created"}]
        }))
        .unwrap();

        assert_eq!(wf.version, 1);
        assert_eq!(wf.steps[0].step_type, StepType::Approval);
        assert!(wf.matches_trigger("content:created", Some("article"), None));
        assert!(!wf.matches_trigger("content:deleted", None, None));
    }

    #[test]
    fn trigger_respects_tenant_and_content_type() {
        let mut wf: Workflow = serde_json::from_value(json!({
            "id": "wf", "name": "n", "status": "ACTIVE", "startStepId": "a", "tenantId": "t1",
            "steps": [],
            "triggers": [{"eventType": "content:published", "contentTypeId": "article"}]
        }))
        .unwrap();

        assert!(wf.matches_trigger("content:published", Some("article"), Some("t1")));
        assert!(!wf.matches_trigger("content:published", Some("article"), Some("t2")));
        assert!(!wf.matches_trigger("content:published", Some("page"), Some("t1")));
        assert!(!wf.matches_trigger("content:published", None, Some("t1")));

        wf.status = WorkflowStatus::Inactive;
        assert!(!wf.matches_trigger("content:published", Some("article"), Some("t1")));
    }

    #[test]
    fn terminal_patch_clears_current_step() {
        let mut inst = instance(InstanceStatus::Running, Some("a"));
        InstancePatch::terminal(InstanceStatus::Failed, json!({"error": "boom"})).apply(&mut inst);

        assert_eq!(inst.status, InstanceStatus::Failed);
        assert!(inst.current_step_id.is_none());
        assert!(inst.completed_at.is_some());
    }

    #[test]
    fn guard_checks_status_and_step() {
        let guard = TransitionGuard::on_step(&InstanceStatus::ACTIVE, "a");
        assert!(guard.admits(&instance(InstanceStatus::Running, Some("a"))));
        assert!(!guard.admits(&instance(InstanceStatus::Running, Some("b"))));
        assert!(!guard.admits(&instance(InstanceStatus::Cancelled, Some("a"))));

        let any_step = TransitionGuard::in_status(&InstanceStatus::CANCELLABLE);
        assert!(any_step.admits(&instance(InstanceStatus::Suspended, Some("x"))));
    }
}
