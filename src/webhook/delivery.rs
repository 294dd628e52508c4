/// Outbound delivery: payloads, signing and the HTTP transport
///
/// Every delivery is a JSON POST carrying `X-Webhook-ID`, `X-Webhook-Event`,
/// `X-Webhook-Timestamp` and, for webhooks with a secret,
/// `X-Webhook-Signature: sha256=<hex HMAC-SHA256 of the body>`.

use crate::webhook::types::{RequestSnapshot, Webhook, WebhookEvent};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::{collections::HashMap, time::Duration};

pub const HEADER_ID: &str = "X-Webhook-ID";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Event type announced for batched deliveries
pub const BATCH_EVENT: &str = "batch";

/// Response bodies kept on delivery records are cut to this many chars
const MAX_RECORDED_BODY: usize = 4096;

/// Hex HMAC-SHA256 of `body` keyed with `secret`
pub fn sign_payload(secret: &str, body: &str) -> Result<String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid signing key: {}", e))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a `sha256=<hex>` header against a body
pub fn verify_signature(secret: &str, body: &str, header: &str) -> bool {
    let Some(given) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(given) = hex::decode(given) else {
        return false;
    };
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    mac.verify_slice(&given).is_ok()
}

/// Body for a single event
pub fn event_payload(event: &WebhookEvent, data: Value) -> Value {
    json!({
        "type": event.event_type,
        "data": data,
        "tenantId": event.tenant_id,
        "timestamp": event.timestamp.to_rfc3339(),
    })
}

/// A fully built POST
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub timeout: Duration,
}

impl OutboundRequest {
    /// Serialize `payload` and attach the standard and custom headers
    pub fn build(webhook: &Webhook, event_type: &str, payload: &Value, timeout: Duration) -> Result<Self> {
        let body = serde_json::to_string(payload)?;

        let mut headers = webhook.headers.clone();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(HEADER_ID.to_string(), webhook.id.to_string());
        headers.insert(HEADER_EVENT.to_string(), event_type.to_string());
        headers.insert(HEADER_TIMESTAMP.to_string(), Utc::now().to_rfc3339());
        if let Some(secret) = webhook.secret.as_deref().filter(|s| !s.is_empty()) {
            headers.insert(
                HEADER_SIGNATURE.to_string(),
                format!("sha256={}", sign_payload(secret, &body)?),
            );
        }

        Ok(Self {
            url: webhook.url.clone(),
            headers,
            body,
            timeout,
        })
    }

    /// Snapshot stored on the delivery record; the signature is not kept
    pub fn snapshot(&self) -> RequestSnapshot {
        let mut headers = self.headers.clone();
        headers.remove(HEADER_SIGNATURE);
        RequestSnapshot {
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn recorded_body(&self) -> String {
        self.body.chars().take(MAX_RECORDED_BODY).collect()
    }
}

/// HTTP transport collaborator
///
/// Any status code is a response; only network-level problems (connect
/// failure, timeout) are errors.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &OutboundRequest) -> Result<TransportResponse>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("contentway-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        tracing::debug!("🌍 POST {} ({} bytes)", request.url, request.body.len());

        let mut request_builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (key, value) in &request.headers {
            request_builder = request_builder.header(key.as_str(), value.as_str());
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        tracing::debug!("📡 Response status: {}", status);
        Ok(TransportResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::types::WebhookStatus;
    use uuid::Uuid;

    fn webhook(secret: Option<&str>) -> Webhook {
        Webhook {
            id: Uuid::new_v4(),
            name: "hook".into(),
            url: "https://example.test/in".into(),
            secret: secret.map(str::to_string),
            events: vec!["*".into()],
            status: WebhookStatus::Active,
            tenant_id: None,
            content_type_ids: None,
            headers: HashMap::from([("X-Custom".to_string(), "1".to_string())]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn hmac_matches_known_vector() {
        // RFC 4231 test case 2
        let signature = sign_payload("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signed_request_carries_all_headers() {
        let hook = webhook(Some("s3cret"));
        let request = OutboundRequest::build(
            &hook,
            "workflow:step:completed",
            &json!({"a": 1}),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(request.headers[HEADER_ID], hook.id.to_string());
        assert_eq!(request.headers[HEADER_EVENT], "workflow:step:completed");
        assert!(request.headers.contains_key(HEADER_TIMESTAMP));
        assert_eq!(request.headers["X-Custom"], "1");

        let signature = &request.headers[HEADER_SIGNATURE];
        assert!(verify_signature("s3cret", &request.body, signature));
        assert!(!verify_signature("other", &request.body, signature));
        assert!(!request.snapshot().headers.contains_key(HEADER_SIGNATURE));
    }

    #[test]
    fn unsigned_without_secret() {
        let request =
            OutboundRequest::build(&webhook(None), "x", &json!({}), Duration::from_secs(1)).unwrap();
        assert!(!request.headers.contains_key(HEADER_SIGNATURE));
    }

    #[test]
    fn only_2xx_is_success() {
        let response = |status| TransportResponse {
            status,
            body: String::new(),
        };
        assert!(response(200).is_success());
        assert!(response(204).is_success());
        assert!(!response(302).is_success());
        assert!(!response(500).is_success());
    }
}
