/// Runtime Execution Engine
///
/// This module drives workflow instances:
/// - Instance state machine with guarded transitions
/// - Step-type handlers (approval, notification, condition, action, delay)
/// - Sandboxed condition language for CONDITION steps
/// - Continuation work queue and one-shot job scheduler

// Instance lifecycle and step state machine
pub mod engine;

// Step-type handlers and their collaborators
pub mod executor;

// Boolean expression language evaluated against instance data
pub mod condition;

// Continuation queue with idle tracking
pub mod queue;

// One-shot scheduler for delayed step completion
pub mod scheduler;

// Re-export main types
pub use condition::{evaluate_condition, Condition, ConditionError};
pub use engine::{ExecutionEngine, StepCompletion};
pub use executor::{
    ActionContext, ActionHandler, ActionRegistry, LogNotificationSender, Notification,
    NotificationSender, StepExecutor, StepOutcome,
};
pub use queue::WorkQueue;
pub use scheduler::{CronJobScheduler, JobHandler, JobSpec, ScheduledJob, Scheduler};
