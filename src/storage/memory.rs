use crate::{
    storage::PersistenceGateway,
    webhook::types::{Webhook, WebhookDelivery},
    workflow::types::{
        InstanceStepPatch, InstanceTransition, TransitionGuard, Workflow, WorkflowInstance,
        WorkflowInstanceStep,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct InstanceRows {
    instances: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<Uuid, Vec<WorkflowInstanceStep>>,
}

/// Process-local gateway
///
/// Instances and their step records share one lock, which is what makes
/// `transition_instance` atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryGateway {
    workflows: Arc<RwLock<HashMap<String, BTreeMap<u32, Workflow>>>>,
    rows: Arc<RwLock<InstanceRows>>,
    webhooks: Arc<RwLock<HashMap<Uuid, Webhook>>>,
    deliveries: Arc<RwLock<Vec<WebhookDelivery>>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

fn patch_latest_step(steps: &mut [WorkflowInstanceStep], step_id: &str, patch: &InstanceStepPatch) {
    if let Some(row) = steps.iter_mut().rev().find(|s| s.step_id == step_id) {
        row.apply(patch);
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            anyhow::bail!("workflow already exists: {}", workflow.id);
        }
        workflows
            .entry(workflow.id.clone())
            .or_default()
            .insert(workflow.version, workflow.clone());
        Ok(())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        let versions = workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| anyhow::anyhow!("workflow not found: {}", workflow.id))?;
        versions.insert(workflow.version, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .read()
            .await
            .get(id)
            .and_then(|v| v.values().next_back().cloned()))
    }

    async fn get_workflow_version(&self, id: &str, version: u32) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .read()
            .await
            .get(id)
            .and_then(|v| v.get(&version).cloned()))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self
            .workflows
            .read()
            .await
            .values()
            .filter_map(|v| v.values().next_back().cloned())
            .collect())
    }

    async fn find_active_workflows_for_trigger(
        &self,
        event_type: &str,
        content_type_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Workflow>> {
        Ok(self
            .list_workflows()
            .await?
            .into_iter()
            .filter(|wf| wf.matches_trigger(event_type, content_type_id, tenant_id))
            .collect())
    }

    async fn create_instance(
        &self,
        instance: &WorkflowInstance,
        first_step: &WorkflowInstanceStep,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.instances.insert(instance.id, instance.clone());
        rows.steps.insert(instance.id, vec![first_step.clone()]);
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        Ok(self.rows.read().await.instances.get(&id).cloned())
    }

    async fn transition_instance(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        transition: &InstanceTransition,
    ) -> Result<Option<WorkflowInstance>> {
        let mut rows = self.rows.write().await;
        let rows = &mut *rows;

        let Some(instance) = rows.instances.get_mut(&id) else {
            return Ok(None);
        };
        if !guard.admits(instance) {
            return Ok(None);
        }

        transition.patch.apply(instance);
        let updated = instance.clone();

        let steps = rows.steps.entry(id).or_default();
        if let Some((step_id, patch)) = &transition.step_update {
            patch_latest_step(steps, step_id, patch);
        }
        if let Some(new_step) = &transition.new_step {
            steps.push(new_step.clone());
        }

        Ok(Some(updated))
    }

    async fn list_instance_steps(&self, instance_id: Uuid) -> Result<Vec<WorkflowInstanceStep>> {
        Ok(self
            .rows
            .read()
            .await
            .steps
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.webhooks.write().await.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<()> {
        let mut webhooks = self.webhooks.write().await;
        if !webhooks.contains_key(&webhook.id) {
            anyhow::bail!("webhook not found: {}", webhook.id);
        }
        webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn delete_webhook(&self, id: Uuid) -> Result<bool> {
        Ok(self.webhooks.write().await.remove(&id).is_some())
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        Ok(self.webhooks.read().await.get(&id).cloned())
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self.webhooks.read().await.values().cloned().collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        self.deliveries.write().await.push(delivery.clone());
        Ok(())
    }

    async fn list_deliveries(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .read()
            .await
            .iter()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{InstancePatch, InstanceStatus, StepStatus};
    use chrono::Utc;
    use serde_json::json;

    fn sample_instance() -> (WorkflowInstance, WorkflowInstanceStep) {
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            workflow_version: 1,
            tenant_id: None,
            status: InstanceStatus::Pending,
            current_step_id: Some("a".into()),
            content_id: None,
            media_id: None,
            created_by: None,
            data: json!({}),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let step = WorkflowInstanceStep::pending(instance.id, "a");
        (instance, step)
    }

    fn advance_to(step: &str, from: &str, id: Uuid) -> InstanceTransition {
        InstanceTransition {
            patch: InstancePatch {
                status: Some(InstanceStatus::Running),
                current_step_id: Some(Some(step.to_string())),
                ..Default::default()
            },
            step_update: Some((
                from.to_string(),
                InstanceStepPatch {
                    status: Some(StepStatus::Completed),
                    ..Default::default()
                },
            )),
            new_step: Some(WorkflowInstanceStep::pending(id, step)),
        }
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let gw = MemoryGateway::new();
        let (instance, first) = sample_instance();
        gw.create_instance(&instance, &first).await.unwrap();

        let guard = TransitionGuard::on_step(&InstanceStatus::ACTIVE, "a");
        let first_try = gw
            .transition_instance(instance.id, &guard, &advance_to("b", "a", instance.id))
            .await
            .unwrap();
        assert_eq!(first_try.unwrap().current_step_id.as_deref(), Some("b"));

        // Same guard again: the instance has moved on
        let second_try = gw
            .transition_instance(instance.id, &guard, &advance_to("b", "a", instance.id))
            .await
            .unwrap();
        assert!(second_try.is_none());

        let steps = gw.list_instance_steps(instance.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].step_id, "b");
    }

    #[tokio::test]
    async fn workflow_versions_are_retained() {
        let gw = MemoryGateway::new();
        let mut wf: Workflow = serde_json::from_value(json!({
            "id": "wf", "name": "v1", "startStepId": "a",
            "steps": [{"id": "a", "type": "APPROVAL", "order": 1}]
        }))
        .unwrap();
        gw.create_workflow(&wf).await.unwrap();
        assert!(gw.create_workflow(&wf).await.is_err());

        wf.version = 2;
        wf.name = "v2".into();
        gw.update_workflow(&wf).await.unwrap();

        assert_eq!(gw.get_workflow("wf").await.unwrap().unwrap().name, "v2");
        assert_eq!(gw.get_workflow_version("wf", 1).await.unwrap().unwrap().name, "v1");
        assert_eq!(gw.list_workflows().await.unwrap().len(), 1);
    }
}
