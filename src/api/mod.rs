/// HTTP API Layer
///
/// Thin REST surface over the core so it can run as a process:
/// - Workflow definitions and instance control
/// - Webhook registry, delivery history and manual triggers

// Workflow and instance endpoints
pub mod workflows;

// Webhook endpoints
pub mod webhooks;

// Re-export router builders
pub use webhooks::{create_webhook_routes, WebhookAppState};
pub use workflows::{create_workflow_routes, AppState};
