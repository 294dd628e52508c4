/// Persistence gateway
///
/// The narrow storage interface the core depends on. Two backends ship with the
/// crate:
/// - `MemoryGateway`: process-local maps, for tests and embedded use
/// - `SqliteGateway`: sqlx/SQLite with JSON bodies and indexed lookup columns

use crate::{
    webhook::types::{Webhook, WebhookDelivery},
    workflow::types::{
        InstanceTransition, TransitionGuard, Workflow, WorkflowInstance, WorkflowInstanceStep,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

/// Storage operations for workflow definitions, instances and webhooks
///
/// Calls that change several rows together (`create_instance`,
/// `transition_instance`) are atomic in every implementation.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // Workflow definitions (all versions are retained)
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()>;
    /// Store a new version of an existing workflow
    async fn update_workflow(&self, workflow: &Workflow) -> Result<()>;
    /// Latest version
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn get_workflow_version(&self, id: &str, version: u32) -> Result<Option<Workflow>>;
    /// Latest version of every workflow
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;
    async fn find_active_workflows_for_trigger(
        &self,
        event_type: &str,
        content_type_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Workflow>>;

    // Instances
    /// Insert an instance together with its first step record
    async fn create_instance(
        &self,
        instance: &WorkflowInstance,
        first_step: &WorkflowInstanceStep,
    ) -> Result<()>;
    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>>;
    /// Compare-and-swap transition
    ///
    /// Applies the patch, the step update and the new step record atomically if
    /// and only if the stored instance satisfies `guard`. Returns `None` when the
    /// guard rejected the transition (or the instance does not exist).
    async fn transition_instance(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        transition: &InstanceTransition,
    ) -> Result<Option<WorkflowInstance>>;
    /// Step records in creation order
    async fn list_instance_steps(&self, instance_id: Uuid) -> Result<Vec<WorkflowInstanceStep>>;

    // Webhooks
    async fn create_webhook(&self, webhook: &Webhook) -> Result<()>;
    async fn update_webhook(&self, webhook: &Webhook) -> Result<()>;
    async fn delete_webhook(&self, id: Uuid) -> Result<bool>;
    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>>;
    async fn list_webhooks(&self) -> Result<Vec<Webhook>>;
    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;
    /// Most recent first
    async fn list_deliveries(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<WebhookDelivery>>;
}
