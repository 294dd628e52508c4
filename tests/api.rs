use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use contentway::{
    config::Config,
    server::Services,
    storage::SqliteGateway,
    webhook::delivery::ReqwestTransport,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;

async fn services() -> Services {
    let storage = SqliteGateway::in_memory().await.unwrap();
    let transport = ReqwestTransport::new().unwrap();
    Services::start(&Config::default(), Arc::new(storage), Arc::new(transport))
        .await
        .unwrap()
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", "tester")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

fn review_workflow() -> Value {
    json!({
        "id": "review",
        "name": "Editorial review",
        "status": "ACTIVE",
        "startStepId": "edit",
        "steps": [
            {"id": "edit", "type": "APPROVAL", "config": {"approvers": ["editor"]}, "nextSteps": ["legal"], "order": 1},
            {"id": "legal", "type": "APPROVAL", "config": {"approvers": ["legal"]}, "order": 2}
        ]
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workflow_lifecycle_over_http() {
    let services = services().await;
    let app = services.router();

    let (status, body) = call(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));

    let (status, created) = call(&app, "POST", "/api/workflows", Some(review_workflow())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["version"], 1);

    let (status, body) = call(&app, "POST", "/api/workflows", Some(review_workflow())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, body) = call(&app, "GET", "/api/workflows/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, instance) = call(
        &app,
        "POST",
        "/api/workflows/review/instances",
        Some(json!({"contentId": "article-1", "userId": "author"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = instance["id"].as_str().unwrap().to_string();
    tokio::time::timeout(Duration::from_secs(5), services.engine.wait_idle())
        .await
        .unwrap();

    let (status, moved) = call(
        &app,
        "POST",
        &format!("/api/instances/{}/steps/edit/complete", id),
        Some(json!({"userId": "editor", "notes": "looks good"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["currentStepId"], "legal");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/api/instances/{}/steps/edit/complete", id),
        Some(json!({"userId": "editor"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (status, rejected) = call(
        &app,
        "POST",
        &format!("/api/instances/{}/steps/legal/reject", id),
        Some(json!({"userId": "counsel", "reason": "missing sources"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "FAILED");

    let (status, steps) = call(&app, "GET", &format!("/api/instances/{}/steps", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(steps.as_array().unwrap().len(), 2);

    services.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_registry_over_http() {
    let services = services().await;
    let app = services.router();

    let (status, body) = call(
        &app,
        "POST",
        "/api/webhooks",
        Some(json!({"name": "bad", "url": "not a url", "events": ["x"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let (status, webhook) = call(
        &app,
        "POST",
        "/api/webhooks",
        Some(json!({
            "name": "search indexer",
            "url": "http://127.0.0.1:9/hook",
            "secret": "s3cret",
            "events": ["content:published"],
            "tenantId": "acme"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(webhook.get("secret").is_none());
    let id = webhook["id"].as_str().unwrap().to_string();

    let (status, listed) = call(&app, "GET", "/api/webhooks?tenantId=acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, other) = call(&app, "GET", "/api/webhooks?tenantId=globex", None).await;
    assert!(other.as_array().unwrap().is_empty());

    let (status, circuit) = call(&app, "GET", &format!("/api/webhooks/{}/circuit", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(circuit["state"], "closed");

    let (status, _) = call(&app, "DELETE", &format!("/api/webhooks/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "GET", &format!("/api/webhooks/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    services.shutdown().await.unwrap();
}
