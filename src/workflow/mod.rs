/// Workflow Management Layer
///
/// This module handles workflow definitions, validation and the hot-reload registry:
/// - Type definitions (Workflow, WorkflowStep, WorkflowInstance)
/// - Structural and per-type definition validation
/// - Versioned lock-free registry using ArcSwap

// Core workflow type definitions
pub mod types;

// Definition validation run on every create/update
pub mod validation;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use registry::{CompiledWorkflow, WorkflowRegistry};
pub use types::{
    InstanceStatus, StepStatus, StepType, TriggerContext, TriggerEvent, Workflow,
    WorkflowInstance, WorkflowInstanceStep, WorkflowStatus, WorkflowStep, WorkflowTrigger,
};
pub use validation::{validate_workflow, DefinitionError};
