use async_trait::async_trait;
use contentway::{
    audit::{Auditor, TracingAuditSink},
    config::WebhookConfig,
    error::ApiError,
    events::{self, EventBus},
    storage::MemoryGateway,
    webhook::{
        batch::InMemoryBatchStore,
        breaker::{CircuitState, InMemoryBreakerStore},
        delivery::{
            verify_signature, OutboundRequest, TransportResponse, WebhookTransport, HEADER_EVENT,
            HEADER_ID, HEADER_SIGNATURE,
        },
        service::{WebhookService, TEST_EVENT},
        types::{TriggerOptions, Webhook, WebhookEvent, WebhookInput, WebhookStatus},
    },
};
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Records every request and answers with scripted status codes
struct ScriptedTransport {
    script: Mutex<VecDeque<u16>>,
    fallback: Mutex<u16>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    fn answering(status: u16) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(status),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn then(&self, statuses: &[u16]) {
        self.script.lock().unwrap().extend(statuses);
    }

    fn set_fallback(&self, status: u16) {
        *self.fallback.lock().unwrap() = status;
    }

    fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn post(&self, request: &OutboundRequest) -> anyhow::Result<TransportResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let scripted = self.script.lock().unwrap().pop_front();
        let status = scripted.unwrap_or_else(|| *self.fallback.lock().unwrap());
        Ok(TransportResponse {
            status,
            body: format!("status {}", status),
        })
    }
}

fn config() -> WebhookConfig {
    WebhookConfig {
        circuit_breaker_threshold: 3,
        circuit_breaker_timeout: Duration::from_secs(60),
        half_open_success_threshold: 3,
        max_retries: 0,
        retry_backoff_base: Duration::from_millis(10),
        batching_enabled: true,
        batch_size: 3,
        batch_timeout: Duration::from_secs(60),
        delivery_timeout: Duration::from_secs(5),
        delivery_concurrency: 4,
    }
}

struct Hooks {
    service: Arc<WebhookService>,
    transport: Arc<ScriptedTransport>,
    events: EventBus,
}

impl Hooks {
    async fn start(config: WebhookConfig, listen: bool) -> Self {
        let transport = ScriptedTransport::answering(200);
        let events = EventBus::default();
        let service = WebhookService::new(
            Arc::new(MemoryGateway::new()),
            config,
            Arc::new(InMemoryBreakerStore::new()),
            Arc::new(InMemoryBatchStore::new()),
            transport.clone(),
            events.clone(),
            Auditor::new(Arc::new(TracingAuditSink)),
        );
        service.init(listen).await.unwrap();
        Self {
            service,
            transport,
            events,
        }
    }

    async fn register(&self, events: &[&str], secret: Option<&str>) -> Webhook {
        self.service
            .create_webhook(
                WebhookInput {
                    name: "receiver".into(),
                    url: "https://hooks.example.test/in".into(),
                    secret: secret.map(str::to_string),
                    events: events.iter().map(|e| e.to_string()).collect(),
                    ..Default::default()
                },
                Some("admin"),
            )
            .await
            .unwrap()
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.service.wait_idle())
            .await
            .expect("deliveries did not drain");
    }

    async fn publish(&self, batchable: bool) -> contentway::webhook::TriggerReport {
        let event = WebhookEvent::new("content:published", json!({"contentId": "c-1"}), None);
        let options = TriggerOptions {
            batchable,
            ..Default::default()
        };
        self.service.trigger_webhook(event, options).await.unwrap()
    }
}

fn body(request: &OutboundRequest) -> Value {
    serde_json::from_str(&request.body).unwrap()
}

#[tokio::test]
async fn delivers_signed_payload_and_records_it() {
    let hooks = Hooks::start(config(), false).await;
    let webhook = hooks.register(&["content:published"], Some("s3cret")).await;
    let mut bus = hooks.events.subscribe();

    let report = hooks.publish(false).await;
    assert_eq!((report.matched, report.queued), (1, 1));
    hooks.settle().await;

    let requests = hooks.transport.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.url, "https://hooks.example.test/in");
    assert_eq!(request.headers[HEADER_ID], webhook.id.to_string());
    assert_eq!(request.headers[HEADER_EVENT], "content:published");
    assert!(verify_signature("s3cret", &request.body, &request.headers[HEADER_SIGNATURE]));
    assert_eq!(body(request)["type"], "content:published");
    assert_eq!(body(request)["data"]["contentId"], "c-1");

    let deliveries = hooks.service.list_deliveries(webhook.id, 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].success);
    assert_eq!(deliveries[0].status_code, Some(200));
    assert_eq!(deliveries[0].attempt, 1);
    assert!(!deliveries[0].request.headers.contains_key(HEADER_SIGNATURE));

    let outcome = bus.recv().await.unwrap();
    assert_eq!(outcome.name, events::DELIVERY_SUCCESS);
    assert_eq!(outcome.payload["webhookId"], json!(webhook.id));
}

#[tokio::test]
async fn breaker_opens_then_recovers_through_half_open() {
    let mut cfg = config();
    cfg.circuit_breaker_timeout = Duration::from_millis(200);
    let hooks = Hooks::start(cfg, false).await;
    let webhook = hooks.register(&["content:published"], None).await;
    hooks.transport.set_fallback(500);

    for _ in 0..3 {
        hooks.publish(false).await;
        hooks.settle().await;
    }
    assert_eq!(hooks.transport.calls(), 3);
    let state = hooks.service.breaker_state(webhook.id).await.unwrap();
    assert_eq!(state.state, CircuitState::Open);
    assert_eq!(state.failures, 3);

    // Short-circuited: counted as failed, never sent, count untouched
    let report = hooks.publish(false).await;
    assert_eq!((report.matched, report.failed, report.queued), (1, 1, 0));
    hooks.settle().await;
    assert_eq!(hooks.transport.calls(), 3);
    assert_eq!(hooks.service.breaker_state(webhook.id).await.unwrap().failures, 3);

    tokio::time::sleep(Duration::from_millis(250)).await;
    hooks.transport.set_fallback(200);

    hooks.publish(false).await;
    hooks.settle().await;
    let probing = hooks.service.breaker_state(webhook.id).await.unwrap();
    assert_eq!(probing.state, CircuitState::HalfOpen);
    assert_eq!(probing.success_count, 1);

    for _ in 0..2 {
        hooks.publish(false).await;
        hooks.settle().await;
    }
    let closed = hooks.service.breaker_state(webhook.id).await.unwrap();
    assert_eq!(closed.state, CircuitState::Closed);
    assert_eq!(closed.failures, 0);
    assert_eq!(hooks.transport.calls(), 6);
}

#[tokio::test]
async fn failed_delivery_is_retried_with_backoff() {
    let mut cfg = config();
    cfg.max_retries = 2;
    cfg.circuit_breaker_threshold = 10;
    let hooks = Hooks::start(cfg, false).await;
    let webhook = hooks.register(&["content:published"], None).await;
    hooks.transport.then(&[500, 503]);

    hooks.publish(false).await;
    hooks.settle().await;

    assert_eq!(hooks.transport.calls(), 3);
    let deliveries = hooks.service.list_deliveries(webhook.id, 10).await.unwrap();
    let attempts: Vec<u32> = deliveries.iter().map(|d| d.attempt).collect();
    assert_eq!(attempts, vec![3, 2, 1]);
    assert!(deliveries[0].success);
    assert!(!deliveries[1].success);
    assert_eq!(deliveries[1].error.as_deref(), Some("HTTP 503"));
    assert_eq!(deliveries[2].status_code, Some(500));
}

#[tokio::test]
async fn retries_stop_after_the_configured_count() {
    let mut cfg = config();
    cfg.max_retries = 1;
    cfg.circuit_breaker_threshold = 10;
    let hooks = Hooks::start(cfg, false).await;
    let webhook = hooks.register(&["content:published"], None).await;
    hooks.transport.set_fallback(500);

    hooks.publish(false).await;
    hooks.settle().await;

    assert_eq!(hooks.transport.calls(), 2);
    let deliveries = hooks.service.list_deliveries(webhook.id, 10).await.unwrap();
    assert!(deliveries.iter().all(|d| !d.success));
}

#[tokio::test]
async fn full_batch_is_flushed_as_one_request() {
    let hooks = Hooks::start(config(), false).await;
    hooks.register(&["content:published"], None).await;

    for _ in 0..2 {
        let report = hooks.publish(true).await;
        assert_eq!((report.batched, report.queued), (1, 0));
    }
    hooks.settle().await;
    assert_eq!(hooks.transport.calls(), 0);

    hooks.publish(true).await;
    hooks.settle().await;

    let requests = hooks.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers[HEADER_EVENT], "batch");
    let payload = body(&requests[0]);
    assert_eq!(payload["type"], "batch");
    assert_eq!(payload["count"], 3);
    assert_eq!(payload["events"][0]["type"], "content:published");
}

#[tokio::test]
async fn sweeper_flushes_partial_batches() {
    let mut cfg = config();
    cfg.batch_size = 10;
    cfg.batch_timeout = Duration::from_millis(50);
    let hooks = Hooks::start(cfg, false).await;
    hooks.register(&["content:published"], None).await;

    hooks.publish(true).await;
    hooks.publish(true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    hooks.settle().await;

    let requests = hooks.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(body(&requests[0])["count"], 2);
}

#[tokio::test]
async fn batching_disabled_delivers_immediately() {
    let mut cfg = config();
    cfg.batching_enabled = false;
    let hooks = Hooks::start(cfg, false).await;
    hooks.register(&["content:published"], None).await;

    let report = hooks.publish(true).await;
    assert_eq!((report.batched, report.queued), (0, 1));
    hooks.settle().await;
    assert_eq!(hooks.transport.calls(), 1);
}

#[tokio::test]
async fn shutdown_flushes_open_batches() {
    let hooks = Hooks::start(config(), false).await;
    hooks.register(&["content:published"], None).await;
    hooks.publish(true).await;

    hooks.service.shutdown().await.unwrap();
    assert_eq!(hooks.transport.calls(), 1);
}

#[tokio::test]
async fn filter_and_transform_apply_per_webhook() {
    let hooks = Hooks::start(config(), false).await;
    let kept = hooks.register(&["content:published"], None).await;
    hooks.register(&["content:published"], None).await;

    let kept_id = kept.id;
    let options = TriggerOptions {
        batchable: false,
        filter: Some(Arc::new(move |_event: &WebhookEvent, webhook: &Webhook| webhook.id == kept_id)),
        transform: Some(Arc::new(
            |event: &WebhookEvent, _webhook: &Webhook| -> anyhow::Result<Value> {
                Ok(json!({"wrapped": event.data}))
            },
        )),
    };
    let event = WebhookEvent::new("content:published", json!({"contentId": "c-9"}), None);
    let report = hooks.service.trigger_webhook(event.clone(), options).await.unwrap();
    assert_eq!((report.matched, report.filtered, report.queued), (2, 1, 1));
    hooks.settle().await;

    let requests = hooks.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(body(&requests[0])["data"]["wrapped"]["contentId"], "c-9");

    let failing = TriggerOptions {
        transform: Some(Arc::new(|_: &WebhookEvent, _: &Webhook| -> anyhow::Result<Value> {
            anyhow::bail!("cannot render")
        })),
        ..Default::default()
    };
    let report = hooks.service.trigger_webhook(event, failing).await.unwrap();
    assert_eq!((report.failed, report.queued), (2, 0));
}

#[tokio::test]
async fn only_matching_webhooks_receive_events() {
    let hooks = Hooks::start(config(), false).await;
    hooks.register(&["content:deleted"], None).await;
    let scoped = hooks
        .service
        .create_webhook(
            WebhookInput {
                name: "articles only".into(),
                url: "http://hooks.example.test/articles".into(),
                events: vec!["*".into()],
                content_type_ids: Some(vec!["article".into()]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    let mut paused = WebhookInput {
        name: "paused".into(),
        url: "http://hooks.example.test/paused".into(),
        events: vec!["content:published".into()],
        ..Default::default()
    };
    paused.status = WebhookStatus::Inactive;
    hooks.service.create_webhook(paused, None).await.unwrap();

    let page = WebhookEvent::new("content:published", json!({"contentTypeId": "page"}), None);
    let report = hooks.service.trigger_webhook(page, TriggerOptions::default()).await.unwrap();
    assert_eq!(report.matched, 0);

    let article = WebhookEvent::new("content:published", json!({"contentTypeId": "article"}), None);
    let report = hooks.service.trigger_webhook(article, TriggerOptions::default()).await.unwrap();
    assert_eq!(report.matched, 1);
    hooks.settle().await;
    assert_eq!(hooks.transport.requests()[0].url, scoped.url);
}

#[tokio::test]
async fn test_delivery_is_recorded_without_touching_breaker() {
    let hooks = Hooks::start(config(), false).await;
    let webhook = hooks.register(&["content:published"], None).await;
    hooks.transport.set_fallback(500);

    let delivery = hooks.service.test_webhook(webhook.id).await.unwrap();
    assert!(!delivery.success);
    assert_eq!(delivery.event_type, TEST_EVENT);
    assert_eq!(delivery.status_code, Some(500));

    let state = hooks.service.breaker_state(webhook.id).await.unwrap();
    assert_eq!(state.failures, 0);
    assert_eq!(hooks.service.list_deliveries(webhook.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn domain_events_reach_subscribed_webhooks() {
    let hooks = Hooks::start(config(), true).await;
    hooks.register(&[events::STEP_COMPLETED], None).await;

    hooks.events.emit(
        events::STEP_COMPLETED,
        None,
        json!({"instanceId": "i-1", "stepId": "review"}),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while hooks.transport.calls() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    hooks.settle().await;

    let requests = hooks.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers[HEADER_EVENT], events::STEP_COMPLETED);
    assert_eq!(body(&requests[0])["data"]["stepId"], "review");
}

#[tokio::test]
async fn registry_operations() {
    let hooks = Hooks::start(config(), false).await;
    let webhook = hooks.register(&["content:published"], Some("keep-me")).await;

    let updated = hooks
        .service
        .update_webhook(
            webhook.id,
            WebhookInput {
                name: "renamed".into(),
                url: webhook.url.clone(),
                events: webhook.events.clone(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.secret.as_deref(), Some("keep-me"));
    assert_eq!(updated.created_at, webhook.created_at);

    let invalid = hooks
        .service
        .create_webhook(
            WebhookInput {
                name: "bad".into(),
                url: "ftp://files.example.test".into(),
                events: vec!["x".into()],
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(invalid, ApiError::Validation(_)));

    hooks.service.delete_webhook(webhook.id, None).await.unwrap();
    assert!(matches!(
        hooks.service.get_webhook(webhook.id).await,
        Err(ApiError::NotFound { .. })
    ));
    assert!(matches!(
        hooks.service.delete_webhook(webhook.id, None).await,
        Err(ApiError::NotFound { .. })
    ));
}
