/// contentway: workflow execution and webhook delivery core
///
/// This library provides the workflow engine of a multi-tenant content
/// management backend (versioned definitions, instance state machine, step
/// handlers, delayed completion) and the outbound webhook engine (matching,
/// batching, circuit breaking, signed delivery with retries).

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every public operation
pub mod error;

// Domain event bus connecting the workflow and webhook engines
pub mod events;

// Fire-and-forget audit trail
pub mod audit;

// Persistence gateway with in-memory and SQLite implementations
pub mod storage;

// Workflow definitions, validation and the versioned registry
pub mod workflow;

// Execution engine, step handlers, work queue and scheduler
pub mod runtime;

// Webhook registry and delivery engine
pub mod webhook;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{ApiError, ApiResult};
pub use runtime::{ExecutionEngine, StepCompletion};
pub use server::{start_server, Services};
pub use webhook::WebhookService;
pub use workflow::{Workflow, WorkflowInstance, WorkflowRegistry, WorkflowStep};
