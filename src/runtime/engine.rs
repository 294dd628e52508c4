/// Workflow execution engine
///
/// Drives instances through PENDING → RUNNING → {COMPLETED | FAILED | CANCELLED}.
/// Every state change is a guarded compare-and-swap through the persistence
/// gateway, keyed on the instance status and its current step, so a step is
/// advanced at most once no matter how many callers race on it.
///
/// Step execution never runs on the caller's task: instantiation and
/// completion enqueue a continuation on the work queue and return.

use crate::{
    audit::{AuditEntry, Auditor},
    error::{ApiError, ApiResult},
    events::{self, EventBus},
    runtime::{
        executor::{StepExecutor, StepOutcome, DELAY_COMPLETION_JOB},
        queue::WorkQueue,
        scheduler::{JobHandler, ScheduledJob, Scheduler},
    },
    storage::PersistenceGateway,
    workflow::{
        registry::WorkflowRegistry,
        types::{
            InstancePatch, InstanceStatus, InstanceStepPatch, InstanceTransition, StepStatus,
            TransitionGuard, TriggerContext, TriggerEvent, Workflow, WorkflowInstance,
            WorkflowInstanceStep, WorkflowStep,
        },
    },
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Caller input for completing a step
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompletion {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub next_step_id: Option<String>,
}

/// Request to execute the step an instance was on when the item was queued
#[derive(Debug, Clone)]
struct Continuation {
    instance_id: Uuid,
    step_id: String,
}

/// Pick the successor of `step`
///
/// An explicit choice wins when it is one of the step's next steps; otherwise a
/// single candidate is taken and no candidate means the workflow is finished.
/// Several candidates without a usable choice is a validation error.
pub fn resolve_next_step(step: &WorkflowStep, requested: Option<&str>) -> ApiResult<Option<String>> {
    if let Some(requested) = requested {
        if step.next_steps.iter().any(|n| n == requested) {
            return Ok(Some(requested.to_string()));
        }
    }
    match step.next_steps.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(only.clone())),
        candidates => Err(ApiError::validation(format!(
            "step '{}' has {} possible next steps {:?}; a nextStepId naming one of them is required",
            step.id,
            candidates.len(),
            candidates
        ))),
    }
}

pub struct ExecutionEngine {
    storage: Arc<dyn PersistenceGateway>,
    registry: Arc<WorkflowRegistry>,
    executor: StepExecutor,
    scheduler: Arc<dyn Scheduler>,
    queue: WorkQueue<Continuation>,
    events: EventBus,
    auditor: Auditor,
}

impl ExecutionEngine {
    pub fn new(
        storage: Arc<dyn PersistenceGateway>,
        registry: Arc<WorkflowRegistry>,
        executor: StepExecutor,
        scheduler: Arc<dyn Scheduler>,
        events: EventBus,
        auditor: Auditor,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            registry,
            executor,
            scheduler,
            queue: WorkQueue::new(concurrency),
            events,
            auditor,
        })
    }

    /// Register the DELAY job handler and start the continuation worker
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.scheduler
            .register_job_handler(
                DELAY_COMPLETION_JOB,
                Arc::new(DelayCompletionHandler {
                    engine: Arc::downgrade(self),
                }),
            )
            .await;

        let weak = Arc::downgrade(self);
        self.queue
            .start(move |continuation: Continuation| {
                let weak = weak.clone();
                async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.run_continuation(continuation).await;
                    }
                }
            })
            .await;

        tracing::info!("⚙️ Execution engine started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        tracing::info!("⏹️ Execution engine stopped");
    }

    /// Resolves once no continuation is queued or running
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Create a PENDING instance at the start step and queue its execution
    pub async fn instantiate(&self, workflow_id: &str, context: TriggerContext) -> ApiResult<WorkflowInstance> {
        let compiled = self
            .registry
            .get_workflow(workflow_id)
            .ok_or_else(|| ApiError::not_found("workflow", workflow_id))?;
        let workflow = &compiled.workflow;
        if !workflow.is_active() {
            return Err(ApiError::validation(format!(
                "workflow '{}' is {:?} and cannot be instantiated",
                workflow.id, workflow.status
            )));
        }

        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            tenant_id: context.tenant_id.or_else(|| workflow.tenant_id.clone()),
            status: InstanceStatus::Pending,
            current_step_id: Some(workflow.start_step_id.clone()),
            content_id: context.content_id,
            media_id: context.media_id,
            created_by: context.user_id,
            data: if context.data.is_null() { json!({}) } else { context.data },
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let first_step = WorkflowInstanceStep::pending(instance.id, &workflow.start_step_id);
        self.storage.create_instance(&instance, &first_step).await?;

        tracing::info!(
            "🆕 Instance {} created for workflow {} v{}",
            instance.id,
            workflow.id,
            workflow.version
        );
        self.auditor.record(
            AuditEntry::new("workflow.instance.create", "workflow_instance", instance.id)
                .user(instance.created_by.as_deref())
                .tenant(instance.tenant_id.as_deref())
                .details(json!({"workflowId": workflow.id, "version": workflow.version})),
        );
        self.events.emit(
            events::INSTANCE_CREATED,
            instance.tenant_id.clone(),
            json!({
                "instanceId": instance.id,
                "workflowId": workflow.id,
                "contentId": instance.content_id,
                "userId": instance.created_by,
            }),
        );

        self.continue_with(instance.id, &workflow.start_step_id)?;
        Ok(instance)
    }

    /// Instantiate every active workflow whose triggers match the event
    pub async fn handle_trigger(&self, event: TriggerEvent) -> ApiResult<Vec<WorkflowInstance>> {
        let matched = self.registry.find_for_trigger(
            &event.event_type,
            event.content_type_id.as_deref(),
            event.context.tenant_id.as_deref(),
        );
        tracing::debug!("🎯 Event {} matched {} workflows", event.event_type, matched.len());

        let mut instances = Vec::with_capacity(matched.len());
        for workflow in matched {
            match self.instantiate(&workflow.id, event.context.clone()).await {
                Ok(instance) => instances.push(instance),
                Err(e) => tracing::warn!(
                    "⚠️ Trigger {} could not start workflow {}: {}",
                    event.event_type,
                    workflow.id,
                    e
                ),
            }
        }
        Ok(instances)
    }

    async fn run_continuation(&self, continuation: Continuation) {
        if let Err(e) = self
            .execute(continuation.instance_id, &continuation.step_id)
            .await
        {
            tracing::error!(
                "❌ Continuation for instance {} step {} failed: {:#}",
                continuation.instance_id,
                continuation.step_id,
                e
            );
        }
    }

    async fn execute(&self, instance_id: Uuid, expected_step: &str) -> Result<()> {
        let Some(instance) = self.storage.get_instance(instance_id).await? else {
            tracing::warn!("⚠️ Instance {} not found, nothing to execute", instance_id);
            return Ok(());
        };
        if !instance.is_active() {
            tracing::debug!(
                "⏭️ Instance {} is {}, skipping execution",
                instance_id,
                instance.status.as_str()
            );
            return Ok(());
        }
        let Some(step_id) = instance.current_step_id.clone() else {
            tracing::error!("❌ Active instance {} has no current step", instance_id);
            return Ok(());
        };
        if expected_step != step_id {
            tracing::debug!("⏭️ Instance {} already moved past the queued step", instance_id);
            return Ok(());
        }

        let Some(workflow) = self.workflow_for(&instance).await? else {
            tracing::error!(
                "❌ Workflow {} v{} of instance {} is missing",
                instance.workflow_id,
                instance.workflow_version,
                instance_id
            );
            return Ok(());
        };
        let Some(step) = workflow.step(&step_id).cloned() else {
            tracing::error!(
                "❌ Step {} of instance {} does not exist in workflow {} v{}",
                step_id,
                instance_id,
                workflow.id,
                workflow.version
            );
            return Ok(());
        };

        let Some(instance) = self.mark_running(instance).await? else {
            return Ok(());
        };

        match self.executor.execute_step(&instance, &step).await {
            Ok(StepOutcome::Wait) => {
                tracing::debug!("⏸️ Instance {} waits for input on step {}", instance_id, step.id);
            }
            Ok(StepOutcome::Scheduled { job_id, fire_at }) => {
                tracing::debug!(
                    "⏳ Instance {} step {} resumes with job {} at {}",
                    instance_id,
                    step.id,
                    job_id,
                    fire_at
                );
            }
            Ok(StepOutcome::Complete { result, next_step_id }) => {
                let completion = StepCompletion {
                    user_id: None,
                    result: Some(result),
                    notes: None,
                    next_step_id,
                };
                match self.complete_step(instance_id, &step.id, completion).await {
                    Ok(_) => {}
                    Err(ApiError::BadRequest(reason)) => {
                        tracing::debug!("⏭️ Discarding outcome of step {}: {}", step.id, reason);
                    }
                    Err(e) => self.fail_instance(instance_id, &step.id, &e.to_string()).await?,
                }
            }
            Err(e) => self.fail_instance(instance_id, &step.id, &e.to_string()).await?,
        }
        Ok(())
    }

    /// PENDING → RUNNING on first execution; None when the instance moved on meanwhile
    async fn mark_running(&self, instance: WorkflowInstance) -> Result<Option<WorkflowInstance>> {
        if instance.status != InstanceStatus::Pending {
            return Ok(Some(instance));
        }
        let Some(step_id) = instance.current_step_id.clone() else {
            return Ok(None);
        };

        let transition = InstanceTransition {
            patch: InstancePatch {
                status: Some(InstanceStatus::Running),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            ..Default::default()
        };
        let guard = TransitionGuard::on_step(&[InstanceStatus::Pending], &step_id);
        if let Some(running) = self.storage.transition_instance(instance.id, &guard, &transition).await? {
            tracing::info!("▶️ Instance {} started", running.id);
            return Ok(Some(running));
        }

        // Lost the race: only proceed if it is still active on the same step
        Ok(self
            .storage
            .get_instance(instance.id)
            .await?
            .filter(|i| i.is_active() && i.current_step_id.as_deref() == Some(step_id.as_str())))
    }

    /// Complete the instance's current step and advance
    pub async fn complete_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
        completion: StepCompletion,
    ) -> ApiResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id).await?;
        ensure_on_step(&instance, step_id)?;
        let workflow = self.pinned_workflow(&instance).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| ApiError::not_found("step", step_id))?;

        let next = resolve_next_step(step, completion.next_step_id.as_deref())?;

        let now = Utc::now();
        let step_update = InstanceStepPatch {
            status: Some(StepStatus::Completed),
            result: completion.result.clone(),
            notes: completion.notes.clone(),
            completed_by: completion.user_id.clone(),
            completed_at: Some(now),
            ..Default::default()
        };
        let transition = match &next {
            Some(next_id) => InstanceTransition {
                patch: InstancePatch {
                    status: Some(InstanceStatus::Running),
                    current_step_id: Some(Some(next_id.clone())),
                    started_at: instance.started_at.is_none().then_some(now),
                    ..Default::default()
                },
                step_update: Some((step_id.to_string(), step_update)),
                new_step: Some(WorkflowInstanceStep::pending(instance_id, next_id)),
            },
            None => InstanceTransition {
                patch: InstancePatch::terminal(
                    InstanceStatus::Completed,
                    json!({
                        "completed": true,
                        "finalStepId": step_id,
                        "output": completion.result.clone().unwrap_or(Value::Null),
                    }),
                ),
                step_update: Some((step_id.to_string(), step_update)),
                new_step: None,
            },
        };

        let guard = TransitionGuard::on_step(&InstanceStatus::ACTIVE, step_id);
        let updated = self
            .storage
            .transition_instance(instance_id, &guard, &transition)
            .await?
            .ok_or_else(|| stale_step(instance_id, step_id))?;

        tracing::info!(
            "✅ Instance {} completed step {} -> {}",
            instance_id,
            step_id,
            next.as_deref().unwrap_or("(end)")
        );
        self.auditor.record(
            AuditEntry::new("workflow.step.complete", "workflow_instance", instance_id)
                .user(completion.user_id.as_deref())
                .tenant(updated.tenant_id.as_deref())
                .details(json!({"stepId": step_id, "nextStepId": next})),
        );
        self.events.emit(
            events::STEP_COMPLETED,
            updated.tenant_id.clone(),
            json!({
                "instanceId": instance_id,
                "workflowId": updated.workflow_id,
                "stepId": step_id,
                "nextStepId": next,
                "userId": completion.user_id,
                "result": completion.result,
            }),
        );

        match next {
            Some(next_id) => self.continue_with(instance_id, &next_id)?,
            None => {
                tracing::info!("🏁 Instance {} completed", instance_id);
                self.events.emit(
                    events::INSTANCE_COMPLETED,
                    updated.tenant_id.clone(),
                    json!({
                        "instanceId": instance_id,
                        "workflowId": updated.workflow_id,
                        "contentId": updated.content_id,
                        "result": updated.result,
                    }),
                );
            }
        }
        Ok(updated)
    }

    /// Reject the current step; the instance fails and runs nothing further
    pub async fn reject_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
        user_id: Option<&str>,
        reason: &str,
    ) -> ApiResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id).await?;
        ensure_on_step(&instance, step_id)?;

        let now = Utc::now();
        let result = json!({
            "rejected": true,
            "reason": reason,
            "rejectedBy": user_id,
            "stepId": step_id,
            "rejectedAt": now.to_rfc3339(),
        });
        let transition = InstanceTransition {
            patch: InstancePatch::terminal(InstanceStatus::Failed, result),
            step_update: Some((
                step_id.to_string(),
                InstanceStepPatch {
                    status: Some(StepStatus::Rejected),
                    notes: Some(reason.to_string()),
                    completed_by: user_id.map(str::to_string),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )),
            new_step: None,
        };

        let guard = TransitionGuard::on_step(&InstanceStatus::ACTIVE, step_id);
        let updated = self
            .storage
            .transition_instance(instance_id, &guard, &transition)
            .await?
            .ok_or_else(|| stale_step(instance_id, step_id))?;

        tracing::info!("🚫 Instance {} rejected at step {}: {}", instance_id, step_id, reason);
        self.auditor.record(
            AuditEntry::new("workflow.step.reject", "workflow_instance", instance_id)
                .user(user_id)
                .tenant(updated.tenant_id.as_deref())
                .details(json!({"stepId": step_id, "reason": reason})),
        );
        self.events.emit(
            events::STEP_REJECTED,
            updated.tenant_id.clone(),
            json!({
                "instanceId": instance_id,
                "workflowId": updated.workflow_id,
                "stepId": step_id,
                "reason": reason,
                "userId": user_id,
            }),
        );
        Ok(updated)
    }

    /// Hand the current step to someone; instance status is left alone
    pub async fn assign_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
        assignee: &str,
        user_id: Option<&str>,
    ) -> ApiResult<WorkflowInstanceStep> {
        let instance = self.load_instance(instance_id).await?;
        ensure_on_step(&instance, step_id)?;

        let transition = InstanceTransition {
            step_update: Some((
                step_id.to_string(),
                InstanceStepPatch {
                    status: Some(StepStatus::InProgress),
                    assigned_to: Some(assignee.to_string()),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let guard = TransitionGuard::on_step(&InstanceStatus::ACTIVE, step_id);
        let updated = self
            .storage
            .transition_instance(instance_id, &guard, &transition)
            .await?
            .ok_or_else(|| stale_step(instance_id, step_id))?;

        let record = self
            .storage
            .list_instance_steps(instance_id)
            .await?
            .into_iter()
            .rev()
            .find(|s| s.step_id == step_id)
            .ok_or_else(|| ApiError::not_found("step", step_id))?;

        tracing::info!("👤 Step {} of instance {} assigned to {}", step_id, instance_id, assignee);
        self.auditor.record(
            AuditEntry::new("workflow.step.assign", "workflow_instance", instance_id)
                .user(user_id)
                .tenant(updated.tenant_id.as_deref())
                .details(json!({"stepId": step_id, "assignedTo": assignee})),
        );
        self.events.emit(
            events::STEP_ASSIGNED,
            updated.tenant_id.clone(),
            json!({
                "instanceId": instance_id,
                "stepId": step_id,
                "assignedTo": assignee,
                "userId": user_id,
            }),
        );
        Ok(record)
    }

    /// Cancel from PENDING, RUNNING or SUSPENDED
    ///
    /// In-flight handlers and scheduled jobs are not interrupted; they find the
    /// instance CANCELLED when they come back and do nothing.
    pub async fn cancel_instance(
        &self,
        instance_id: Uuid,
        user_id: Option<&str>,
        reason: Option<&str>,
    ) -> ApiResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id).await?;
        if !InstanceStatus::CANCELLABLE.contains(&instance.status) {
            return Err(ApiError::bad_request(format!(
                "instance {} is {} and cannot be cancelled",
                instance_id,
                instance.status.as_str()
            )));
        }

        let transition = InstanceTransition {
            patch: InstancePatch::terminal(
                InstanceStatus::Cancelled,
                json!({"cancelled": true, "reason": reason, "cancelledBy": user_id}),
            ),
            ..Default::default()
        };
        let guard = TransitionGuard::in_status(&InstanceStatus::CANCELLABLE);
        let updated = self
            .storage
            .transition_instance(instance_id, &guard, &transition)
            .await?
            .ok_or_else(|| {
                ApiError::bad_request(format!("instance {} changed state while cancelling", instance_id))
            })?;

        tracing::info!("🛑 Instance {} cancelled", instance_id);
        self.auditor.record(
            AuditEntry::new("workflow.instance.cancel", "workflow_instance", instance_id)
                .user(user_id)
                .tenant(updated.tenant_id.as_deref())
                .details(json!({"reason": reason})),
        );
        self.events.emit(
            events::INSTANCE_CANCELLED,
            updated.tenant_id.clone(),
            json!({
                "instanceId": instance_id,
                "workflowId": updated.workflow_id,
                "reason": reason,
                "userId": user_id,
            }),
        );
        Ok(updated)
    }

    /// RUNNING → SUSPENDED; steps cannot be completed until resumed
    pub async fn suspend_instance(&self, instance_id: Uuid, user_id: Option<&str>) -> ApiResult<WorkflowInstance> {
        let updated = self
            .switch_status(instance_id, InstanceStatus::Running, InstanceStatus::Suspended)
            .await?;
        tracing::info!("⏸️ Instance {} suspended", instance_id);
        self.auditor.record(
            AuditEntry::new("workflow.instance.suspend", "workflow_instance", instance_id)
                .user(user_id)
                .tenant(updated.tenant_id.as_deref()),
        );
        Ok(updated)
    }

    /// SUSPENDED → RUNNING and re-execute the current step
    pub async fn resume_instance(&self, instance_id: Uuid, user_id: Option<&str>) -> ApiResult<WorkflowInstance> {
        let updated = self
            .switch_status(instance_id, InstanceStatus::Suspended, InstanceStatus::Running)
            .await?;
        tracing::info!("▶️ Instance {} resumed", instance_id);
        self.auditor.record(
            AuditEntry::new("workflow.instance.resume", "workflow_instance", instance_id)
                .user(user_id)
                .tenant(updated.tenant_id.as_deref()),
        );
        if let Some(step_id) = updated.current_step_id.as_deref() {
            self.continue_with(instance_id, step_id)?;
        }
        Ok(updated)
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> ApiResult<WorkflowInstance> {
        self.load_instance(instance_id).await
    }

    pub async fn list_instance_steps(&self, instance_id: Uuid) -> ApiResult<Vec<WorkflowInstanceStep>> {
        self.load_instance(instance_id).await?;
        Ok(self.storage.list_instance_steps(instance_id).await?)
    }

    async fn switch_status(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> ApiResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id).await?;
        if instance.status != from {
            return Err(ApiError::bad_request(format!(
                "instance {} is {}, expected {}",
                instance_id,
                instance.status.as_str(),
                from.as_str()
            )));
        }
        let transition = InstanceTransition {
            patch: InstancePatch {
                status: Some(to),
                ..Default::default()
            },
            ..Default::default()
        };
        self.storage
            .transition_instance(instance_id, &TransitionGuard::in_status(&[from]), &transition)
            .await?
            .ok_or_else(|| ApiError::bad_request(format!("instance {} changed state concurrently", instance_id)))
    }

    /// Handler error: instance FAILED with the error, step row FAILED
    async fn fail_instance(&self, instance_id: Uuid, step_id: &str, error: &str) -> Result<()> {
        let transition = InstanceTransition {
            patch: InstancePatch::terminal(
                InstanceStatus::Failed,
                json!({"error": error, "stepId": step_id}),
            ),
            step_update: Some((
                step_id.to_string(),
                InstanceStepPatch {
                    status: Some(StepStatus::Failed),
                    result: Some(json!({"error": error})),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )),
            new_step: None,
        };
        let guard = TransitionGuard::on_step(&InstanceStatus::ACTIVE, step_id);
        let Some(updated) = self.storage.transition_instance(instance_id, &guard, &transition).await? else {
            tracing::debug!("⏭️ Instance {} moved on before failure of step {} was recorded", instance_id, step_id);
            return Ok(());
        };

        tracing::error!("❌ Instance {} failed at step {}: {}", instance_id, step_id, error);
        self.auditor.record(
            AuditEntry::new("workflow.instance.fail", "workflow_instance", instance_id)
                .tenant(updated.tenant_id.as_deref())
                .details(json!({"stepId": step_id, "error": error})),
        );
        self.events.emit(
            events::INSTANCE_FAILED,
            updated.tenant_id.clone(),
            json!({
                "instanceId": instance_id,
                "workflowId": updated.workflow_id,
                "stepId": step_id,
                "error": error,
            }),
        );
        Ok(())
    }

    fn continue_with(&self, instance_id: Uuid, step_id: &str) -> ApiResult<()> {
        self.queue.enqueue(Continuation {
            instance_id,
            step_id: step_id.to_string(),
        })?;
        Ok(())
    }

    async fn load_instance(&self, instance_id: Uuid) -> ApiResult<WorkflowInstance> {
        self.storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| ApiError::not_found("instance", instance_id))
    }

    async fn workflow_for(&self, instance: &WorkflowInstance) -> Result<Option<Arc<Workflow>>> {
        Ok(self
            .registry
            .get_workflow_version(&instance.workflow_id, instance.workflow_version)
            .await?
            .map(|c| c.workflow))
    }

    async fn pinned_workflow(&self, instance: &WorkflowInstance) -> ApiResult<Arc<Workflow>> {
        self.workflow_for(instance).await?.ok_or_else(|| {
            ApiError::not_found(
                "workflow",
                format!("{} v{}", instance.workflow_id, instance.workflow_version),
            )
        })
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("executor", &self.executor)
            .field("pending", &self.queue.pending())
            .finish_non_exhaustive()
    }
}

fn ensure_on_step(instance: &WorkflowInstance, step_id: &str) -> ApiResult<()> {
    if !instance.is_active() {
        return Err(ApiError::bad_request(format!(
            "instance {} is {}; steps can only change while PENDING or RUNNING",
            instance.id,
            instance.status.as_str()
        )));
    }
    if instance.current_step_id.as_deref() != Some(step_id) {
        return Err(ApiError::bad_request(format!(
            "step '{}' is not the current step of instance {} (current: {})",
            step_id,
            instance.id,
            instance.current_step_id.as_deref().unwrap_or("none")
        )));
    }
    Ok(())
}

fn stale_step(instance_id: Uuid, step_id: &str) -> ApiError {
    ApiError::bad_request(format!(
        "step '{}' of instance {} was already handled or the instance changed state",
        step_id, instance_id
    ))
}

/// Resumes DELAY steps when their scheduler job fires
struct DelayCompletionHandler {
    engine: Weak<ExecutionEngine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayPayload {
    instance_id: Uuid,
    step_id: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[async_trait]
impl JobHandler for DelayCompletionHandler {
    async fn run(&self, job: &ScheduledJob) -> Result<Value> {
        let payload: DelayPayload = serde_json::from_value(job.data.clone())?;
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("execution engine is gone"))?;

        // The instance may have been cancelled or moved on while we waited
        let Some(instance) = engine.storage.get_instance(payload.instance_id).await? else {
            return Ok(json!({"skipped": true, "reason": "instance not found"}));
        };
        if !instance.is_active() || instance.current_step_id.as_deref() != Some(payload.step_id.as_str()) {
            tracing::info!(
                "⏭️ Delay for instance {} step {} fired after the instance moved on",
                payload.instance_id,
                payload.step_id
            );
            return Ok(json!({"skipped": true, "status": instance.status.as_str()}));
        }

        let completion = StepCompletion {
            user_id: payload.user_id,
            result: Some(json!({"delayed": true, "firedAt": Utc::now().to_rfc3339()})),
            notes: None,
            next_step_id: None,
        };
        let updated = engine
            .complete_step(payload.instance_id, &payload.step_id, completion)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(json!({"completed": true, "status": updated.status.as_str()}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(next: &[&str]) -> WorkflowStep {
        serde_json::from_value(json!({
            "id": "s", "type": "APPROVAL", "nextSteps": next, "order": 1
        }))
        .unwrap()
    }

    #[test]
    fn next_step_resolution_order() {
        assert_eq!(resolve_next_step(&step(&[]), None).unwrap(), None);
        assert_eq!(resolve_next_step(&step(&["b"]), None).unwrap().as_deref(), Some("b"));
        assert_eq!(
            resolve_next_step(&step(&["b", "c"]), Some("c")).unwrap().as_deref(),
            Some("c")
        );
        // Unknown explicit choice falls back to the single candidate
        assert_eq!(
            resolve_next_step(&step(&["b"]), Some("zzz")).unwrap().as_deref(),
            Some("b")
        );
        assert!(matches!(
            resolve_next_step(&step(&["b", "c"]), None),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            resolve_next_step(&step(&["b", "c"]), Some("zzz")),
            Err(ApiError::Validation(_))
        ));
    }
}
