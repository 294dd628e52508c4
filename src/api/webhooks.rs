/// Webhook registry, delivery history and manual trigger endpoints

use crate::{
    api::workflows::{acting_user, AppState},
    error::ApiResult,
    webhook::{
        breaker::CircuitBreakerState,
        service::WebhookService,
        types::{TriggerOptions, TriggerReport, Webhook, WebhookDelivery, WebhookEvent, WebhookInput},
    },
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_DELIVERY_LIMIT: usize = 50;

/// Extended application state with the webhook service
#[derive(Clone)]
pub struct WebhookAppState {
    /// Base app state with registry and engine
    pub app_state: AppState,
    pub webhooks: Arc<WebhookService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveriesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Manual trigger body: the event plus the options expressible as JSON
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    #[serde(flatten)]
    pub event: WebhookEvent,
    #[serde(default)]
    pub batchable: bool,
}

pub fn create_webhook_routes() -> Router<WebhookAppState> {
    Router::new()
        .route("/api/webhooks", post(create_webhook).get(list_webhooks))
        .route("/api/webhooks/trigger", post(trigger_webhook))
        .route(
            "/api/webhooks/{id}",
            get(get_webhook).put(update_webhook).delete(delete_webhook),
        )
        .route("/api/webhooks/{id}/test", post(test_webhook))
        .route("/api/webhooks/{id}/deliveries", get(list_deliveries))
        .route("/api/webhooks/{id}/circuit", get(circuit_state))
}

/// POST /api/webhooks
async fn create_webhook(
    State(state): State<WebhookAppState>,
    headers: HeaderMap,
    Json(input): Json<WebhookInput>,
) -> ApiResult<(StatusCode, Json<Webhook>)> {
    let user = acting_user(&headers);
    let webhook = state.webhooks.create_webhook(input, user.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

/// GET /api/webhooks?tenantId=...
async fn list_webhooks(
    State(state): State<WebhookAppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Webhook>>> {
    Ok(Json(state.webhooks.list_webhooks(query.tenant_id.as_deref()).await?))
}

/// GET /api/webhooks/{id}
async fn get_webhook(State(state): State<WebhookAppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Webhook>> {
    Ok(Json(state.webhooks.get_webhook(id).await?))
}

/// PUT /api/webhooks/{id}
async fn update_webhook(
    State(state): State<WebhookAppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<WebhookInput>,
) -> ApiResult<Json<Webhook>> {
    let user = acting_user(&headers);
    Ok(Json(state.webhooks.update_webhook(id, input, user.as_deref()).await?))
}

/// DELETE /api/webhooks/{id}
async fn delete_webhook(
    State(state): State<WebhookAppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = acting_user(&headers);
    state.webhooks.delete_webhook(id, user.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/webhooks/{id}/test
async fn test_webhook(
    State(state): State<WebhookAppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WebhookDelivery>> {
    Ok(Json(state.webhooks.test_webhook(id).await?))
}

/// GET /api/webhooks/{id}/deliveries?limit=...
async fn list_deliveries(
    State(state): State<WebhookAppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeliveriesQuery>,
) -> ApiResult<Json<Vec<WebhookDelivery>>> {
    let limit = query.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT);
    Ok(Json(state.webhooks.list_deliveries(id, limit).await?))
}

/// GET /api/webhooks/{id}/circuit
async fn circuit_state(
    State(state): State<WebhookAppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CircuitBreakerState>> {
    Ok(Json(state.webhooks.breaker_state(id).await?))
}

/// POST /api/webhooks/trigger
async fn trigger_webhook(
    State(state): State<WebhookAppState>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerReport>> {
    let options = TriggerOptions {
        batchable: request.batchable,
        ..Default::default()
    };
    Ok(Json(state.webhooks.trigger_webhook(request.event, options).await?))
}
