/// Step-type handlers
///
/// Each handler receives the instance and the step it sits on and reports a
/// `StepOutcome`. Handlers never touch storage; the engine applies the
/// outcome so every state change goes through the same guarded transition.
/// - APPROVAL: waits for an external complete/reject
/// - NOTIFICATION: sends through the `NotificationSender`, then self-completes
/// - CONDITION: evaluates the condition language, self-completes on a branch
/// - ACTION: runs a named `ActionHandler`, self-completes with its result
/// - DELAY: submits a scheduler job and returns

use crate::{
    runtime::{
        condition::evaluate_condition,
        scheduler::{JobSpec, Scheduler},
    },
    workflow::types::{StepType, WorkflowInstance, WorkflowStep},
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

/// Job name for DELAY step resumption
pub const DELAY_COMPLETION_JOB: &str = "workflow_delay_completion";

/// Retry budget for DELAY resumption jobs
pub const DELAY_JOB_MAX_RETRIES: u32 = 3;

/// Longest wait a DELAY step may request
pub const MAX_DELAY_DAYS: i64 = 3_650;

/// What the engine should do after a handler ran
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing happens until someone calls complete/reject
    Wait,
    /// Complete the step now with `result`, optionally choosing the branch
    Complete {
        result: Value,
        next_step_id: Option<String>,
    },
    /// A scheduler job will complete the step later
    Scheduled { job_id: Uuid, fire_at: DateTime<Utc> },
}

/// Message produced by a NOTIFICATION step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub instance_id: Uuid,
    pub step_id: String,
    pub tenant_id: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub message: String,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Default sender: writes the notification to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            "✉️ Notification for instance {} step {} to {:?}: {}",
            notification.instance_id,
            notification.step_id,
            notification.recipients,
            notification.message
        );
        Ok(())
    }
}

/// Context handed to action handlers
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub step: &'a WorkflowStep,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, ctx: ActionContext<'_>, params: &Value) -> Result<Value>;
}

/// Built-in "log" action: logs its params and echoes them back
#[derive(Debug, Default, Clone)]
pub struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn run(&self, ctx: ActionContext<'_>, params: &Value) -> Result<Value> {
        tracing::info!(
            "📝 Action 'log' on instance {} step {}: {}",
            ctx.instance.id,
            ctx.step.id,
            params
        );
        Ok(json!({"logged": true, "params": params}))
    }
}

/// Named action handlers available to ACTION steps
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Registry holding the built-in actions
    pub fn new() -> Self {
        Self::empty().with("log", Arc::new(LogAction))
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with(mut self, name: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Convert a DELAY step config into a duration
pub fn delay_duration(config: &Value) -> Result<chrono::Duration> {
    let amount = config
        .get("duration")
        .and_then(Value::as_f64)
        .filter(|d| *d > 0.0)
        .ok_or_else(|| anyhow::anyhow!("DELAY step needs a positive 'duration'"))?;
    let unit = config.get("unit").and_then(Value::as_str).unwrap_or_default();
    let seconds_per_unit = match unit {
        "seconds" => 1.0,
        "minutes" => 60.0,
        "hours" => 3_600.0,
        "days" => 86_400.0,
        other => anyhow::bail!("unsupported DELAY unit '{}'", other),
    };
    let millis = (amount * seconds_per_unit * 1_000.0).round();
    if millis > (MAX_DELAY_DAYS * 86_400_000) as f64 {
        anyhow::bail!(
            "DELAY of {} {} exceeds the {}-day maximum",
            amount,
            unit,
            MAX_DELAY_DAYS
        );
    }
    chrono::Duration::try_milliseconds(millis as i64)
        .ok_or_else(|| anyhow::anyhow!("DELAY of {} {} is out of range", amount, unit))
}

fn string_list(config: &Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Dispatches steps to their type handler
pub struct StepExecutor {
    notifier: Arc<dyn NotificationSender>,
    actions: ActionRegistry,
    scheduler: Arc<dyn Scheduler>,
}

impl StepExecutor {
    pub fn new(
        notifier: Arc<dyn NotificationSender>,
        actions: ActionRegistry,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            notifier,
            actions,
            scheduler,
        }
    }

    pub async fn execute_step(&self, instance: &WorkflowInstance, step: &WorkflowStep) -> Result<StepOutcome> {
        tracing::info!(
            "🚀 Executing step {} ({:?}) of instance {}",
            step.id,
            step.step_type,
            instance.id
        );
        let start_time = std::time::Instant::now();

        let result = match step.step_type {
            StepType::Approval => Ok(StepOutcome::Wait),
            StepType::Notification => self.execute_notification(instance, step).await,
            StepType::Condition => Ok(Self::execute_condition(instance, step)),
            StepType::Action => self.execute_action(instance, step).await,
            StepType::Delay => self.execute_delay(instance, step).await,
            StepType::Fork | StepType::Join => Err(anyhow::anyhow!(
                "{:?} steps have no handler (step '{}')",
                step.step_type,
                step.id
            )),
        };

        match &result {
            Ok(outcome) => tracing::debug!(
                "✅ Step {} handled in {:?}: {:?}",
                step.id,
                start_time.elapsed(),
                outcome
            ),
            Err(e) => tracing::error!("❌ Step {} failed in {:?}: {}", step.id, start_time.elapsed(), e),
        }
        result
    }

    async fn execute_notification(&self, instance: &WorkflowInstance, step: &WorkflowStep) -> Result<StepOutcome> {
        let recipients = string_list(&step.config, "recipients");
        let notification = Notification {
            instance_id: instance.id,
            step_id: step.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            recipients: recipients.clone(),
            subject: step.config.get("subject").and_then(Value::as_str).map(str::to_string),
            message: step
                .config
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        self.notifier.send(&notification).await?;

        Ok(StepOutcome::Complete {
            result: json!({"notificationSent": true, "recipients": recipients}),
            next_step_id: None,
        })
    }

    fn execute_condition(instance: &WorkflowInstance, step: &WorkflowStep) -> StepOutcome {
        let expression = step.config.get("condition").and_then(Value::as_str).unwrap_or_default();
        let outcome = evaluate_condition(expression, &instance.data);
        let branch_key = if outcome { "trueStepId" } else { "falseStepId" };
        let next_step_id = step
            .config
            .get(branch_key)
            .and_then(Value::as_str)
            .map(str::to_string);

        tracing::debug!("🔀 Condition '{}' on step {} -> {}", expression, step.id, outcome);
        StepOutcome::Complete {
            result: json!({"condition": expression, "result": outcome}),
            next_step_id,
        }
    }

    async fn execute_action(&self, instance: &WorkflowInstance, step: &WorkflowStep) -> Result<StepOutcome> {
        let name = step
            .config
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("ACTION step '{}' has no 'action'", step.id))?;
        let handler = self
            .actions
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown action '{}'", name))?;

        let params = step.config.get("params").cloned().unwrap_or(Value::Null);
        let result = handler.run(ActionContext { instance, step }, &params).await?;

        Ok(StepOutcome::Complete {
            result,
            next_step_id: None,
        })
    }

    async fn execute_delay(&self, instance: &WorkflowInstance, step: &WorkflowStep) -> Result<StepOutcome> {
        let delay = delay_duration(&step.config)?;
        let fire_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| anyhow::anyhow!("DELAY on step '{}' ends past the supported date range", step.id))?;
        let job_id = self
            .scheduler
            .create_job(JobSpec {
                name: DELAY_COMPLETION_JOB.to_string(),
                scheduled_for: fire_at,
                data: json!({
                    "instanceId": instance.id,
                    "stepId": step.id,
                    "userId": instance.created_by,
                }),
                max_retries: DELAY_JOB_MAX_RETRIES,
            })
            .await?;

        tracing::info!(
            "⏳ Instance {} waits on step {} until {}",
            instance.id,
            step.id,
            fire_at.to_rfc3339()
        );
        Ok(StepOutcome::Scheduled { job_id, fire_at })
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}
