/// Structural and per-type validation of workflow definitions

use crate::{
    error::ApiError,
    runtime::{condition::Condition, executor::delay_duration},
    workflow::types::{StepType, Workflow, WorkflowStep},
};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

pub const DELAY_UNITS: [&str; 4] = ["seconds", "minutes", "hours", "days"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow name is required")]
    MissingName,
    #[error("startStepId is required")]
    MissingStartStep,
    #[error("workflow must contain at least one step")]
    NoSteps,
    #[error("startStepId '{0}' does not match any step")]
    UnknownStartStep(String),
    #[error("step id cannot be empty")]
    EmptyStepId,
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
    #[error("steps '{first}' and '{second}' share order {order}")]
    DuplicateOrder { first: String, second: String, order: i32 },
    #[error("step '{step}' points to unknown next step '{next}'")]
    UnknownNextStep { step: String, next: String },
    #[error("step '{0}': {1} steps are not supported")]
    UnsupportedStepType(String, &'static str),
    #[error("step '{step}': {problem}")]
    InvalidConfig { step: String, problem: String },
}

impl From<DefinitionError> for ApiError {
    fn from(value: DefinitionError) -> Self {
        ApiError::Validation(value.to_string())
    }
}

/// Validate a definition; returns the first problem found
pub fn validate_workflow(workflow: &Workflow) -> Result<(), DefinitionError> {
    if workflow.name.trim().is_empty() {
        return Err(DefinitionError::MissingName);
    }
    if workflow.start_step_id.trim().is_empty() {
        return Err(DefinitionError::MissingStartStep);
    }
    if workflow.steps.is_empty() {
        return Err(DefinitionError::NoSteps);
    }

    let mut ids = HashSet::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(DefinitionError::EmptyStepId);
        }
        if !ids.insert(step.id.as_str()) {
            return Err(DefinitionError::DuplicateStepId(step.id.clone()));
        }
    }

    if !ids.contains(workflow.start_step_id.as_str()) {
        return Err(DefinitionError::UnknownStartStep(workflow.start_step_id.clone()));
    }

    for (i, step) in workflow.steps.iter().enumerate() {
        if let Some(other) = workflow.steps[..i].iter().find(|s| s.order == step.order) {
            return Err(DefinitionError::DuplicateOrder {
                first: other.id.clone(),
                second: step.id.clone(),
                order: step.order,
            });
        }
        for next in &step.next_steps {
            if !ids.contains(next.as_str()) {
                return Err(DefinitionError::UnknownNextStep {
                    step: step.id.clone(),
                    next: next.clone(),
                });
            }
        }
        validate_step_config(step)?;
    }

    Ok(())
}

fn invalid(step: &WorkflowStep, problem: impl Into<String>) -> DefinitionError {
    DefinitionError::InvalidConfig {
        step: step.id.clone(),
        problem: problem.into(),
    }
}

fn non_empty_list(config: &Value, key: &str) -> bool {
    config
        .get(key)
        .and_then(Value::as_array)
        .is_some_and(|items| !items.is_empty())
}

fn non_empty_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn validate_step_config(step: &WorkflowStep) -> Result<(), DefinitionError> {
    let config = &step.config;
    match step.step_type {
        StepType::Approval => {
            if !non_empty_list(config, "approvers") {
                return Err(invalid(step, "approval steps need a non-empty 'approvers' list"));
            }
        }
        StepType::Notification => {
            if !non_empty_list(config, "recipients") {
                return Err(invalid(step, "notification steps need a non-empty 'recipients' list"));
            }
            if non_empty_str(config, "message").is_none() {
                return Err(invalid(step, "notification steps need a 'message'"));
            }
        }
        StepType::Condition => {
            let expression = non_empty_str(config, "condition")
                .ok_or_else(|| invalid(step, "condition steps need a 'condition' expression"))?;
            Condition::parse(expression)
                .map_err(|e| invalid(step, format!("condition does not parse: {}", e)))?;
            for key in ["trueStepId", "falseStepId"] {
                if let Some(target) = config.get(key).and_then(Value::as_str) {
                    if !step.next_steps.iter().any(|n| n == target) {
                        return Err(invalid(
                            step,
                            format!("'{}' target '{}' must be listed in nextSteps", key, target),
                        ));
                    }
                }
            }
        }
        StepType::Action => {
            if non_empty_str(config, "action").is_none() {
                return Err(invalid(step, "action steps need an 'action' identifier"));
            }
        }
        StepType::Delay => {
            let duration = config.get("duration").and_then(Value::as_f64).unwrap_or(0.0);
            if duration <= 0.0 {
                return Err(invalid(step, "delay 'duration' must be greater than zero"));
            }
            let unit = config.get("unit").and_then(Value::as_str).unwrap_or_default();
            if !DELAY_UNITS.contains(&unit) {
                return Err(invalid(
                    step,
                    format!("delay 'unit' must be one of {}", DELAY_UNITS.join(", ")),
                ));
            }
            delay_duration(config).map_err(|e| invalid(step, e.to_string()))?;
        }
        StepType::Fork => return Err(DefinitionError::UnsupportedStepType(step.id.clone(), "FORK")),
        StepType::Join => return Err(DefinitionError::UnsupportedStepType(step.id.clone(), "JOIN")),
    }
    Ok(())
}
