/// Webhook delivery layer
///
/// Registry, matching, batching, circuit breaking, signed HTTP delivery and
/// delivery history.

pub mod batch;
pub mod breaker;
pub mod delivery;
pub mod service;
pub mod types;

pub use batch::{BatchStore, InMemoryBatchStore, WebhookBatch};
pub use breaker::{BreakerStore, CircuitBreaker, CircuitBreakerState, CircuitState, InMemoryBreakerStore};
pub use delivery::{ReqwestTransport, TransportResponse, WebhookTransport, OutboundRequest};
pub use service::WebhookService;
pub use types::{
    TriggerOptions, TriggerReport, Webhook, WebhookDelivery, WebhookEvent, WebhookInput, WebhookStatus,
};
