/// Per-webhook circuit breaker
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  timeout elapsed  ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ────────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                   └──────────┘
///      ▲                               ▲         any failure         │
///      │                               └─────────────────────────────┤
///      │                 success threshold                           │
///      └─────────────────────────────────────────────────────────────┘
/// ```
///
/// State lives behind `BreakerStore` so a multi-process deployment can keep
/// it in a shared store; the in-memory store covers a single process.

use crate::config::WebhookConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds shared by every breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Open period before the next probe
    pub reset_timeout: Duration,
}

impl From<&WebhookConfig> for BreakerPolicy {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold.max(1),
            success_threshold: config.half_open_success_threshold.max(1),
            reset_timeout: config.circuit_breaker_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failures: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    /// Whether a delivery may be attempted at `now`
    ///
    /// An open breaker whose timeout has passed moves to half-open here.
    /// A rejected call leaves the counters untouched.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.next_attempt_time.is_some_and(|at| now < at) {
                    return false;
                }
                self.state = CircuitState::HalfOpen;
                self.success_count = 0;
                true
            }
        }
    }

    pub fn record_success(&mut self, policy: &BreakerPolicy) {
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= policy.success_threshold {
                    *self = Self::default();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, policy: &BreakerPolicy, now: DateTime<Utc>) {
        self.last_failure_time = Some(now);
        self.failures = self.failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.failures >= policy.failure_threshold => self.open(policy, now),
            CircuitState::HalfOpen => self.open(policy, now),
            _ => {}
        }
    }

    fn open(&mut self, policy: &BreakerPolicy, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        let timeout = chrono::Duration::from_std(policy.reset_timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        self.next_attempt_time = Some(now + timeout);
    }
}

#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Current state; closed when nothing was stored yet
    async fn load(&self, webhook_id: Uuid) -> Result<CircuitBreakerState>;
    async fn save(&self, webhook_id: Uuid, state: &CircuitBreakerState) -> Result<()>;
    async fn remove(&self, webhook_id: Uuid) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryBreakerStore {
    states: RwLock<HashMap<Uuid, CircuitBreakerState>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(&self, webhook_id: Uuid) -> Result<CircuitBreakerState> {
        Ok(self
            .states
            .read()
            .await
            .get(&webhook_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, webhook_id: Uuid, state: &CircuitBreakerState) -> Result<()> {
        self.states.write().await.insert(webhook_id, state.clone());
        Ok(())
    }

    async fn remove(&self, webhook_id: Uuid) -> Result<()> {
        self.states.write().await.remove(&webhook_id);
        Ok(())
    }
}

/// Breaker front used by the delivery pipeline
///
/// Load-modify-save cycles are serialized so concurrent deliveries to the same
/// webhook cannot lose updates.
pub struct CircuitBreaker {
    store: Arc<dyn BreakerStore>,
    policy: BreakerPolicy,
    update_lock: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn BreakerStore>, policy: BreakerPolicy) -> Self {
        Self {
            store,
            policy,
            update_lock: Mutex::new(()),
        }
    }

    pub async fn allow(&self, webhook_id: Uuid) -> Result<bool> {
        let _guard = self.update_lock.lock().await;
        let mut state = self.store.load(webhook_id).await?;
        let before = state.state;
        let allowed = state.allow(Utc::now());
        if state.state != before {
            tracing::info!("🔌 Circuit for webhook {} is now {}", webhook_id, state.state);
            self.store.save(webhook_id, &state).await?;
        }
        Ok(allowed)
    }

    pub async fn record_success(&self, webhook_id: Uuid) -> Result<CircuitBreakerState> {
        let _guard = self.update_lock.lock().await;
        let mut state = self.store.load(webhook_id).await?;
        let before = state.state;
        state.record_success(&self.policy);
        if state.state != before {
            tracing::info!("🔌 Circuit for webhook {} is now {}", webhook_id, state.state);
        }
        self.store.save(webhook_id, &state).await?;
        Ok(state)
    }

    pub async fn record_failure(&self, webhook_id: Uuid) -> Result<CircuitBreakerState> {
        let _guard = self.update_lock.lock().await;
        let mut state = self.store.load(webhook_id).await?;
        let before = state.state;
        state.record_failure(&self.policy, Utc::now());
        if state.state != before {
            tracing::warn!(
                "🔌 Circuit for webhook {} is now {} after {} failures",
                webhook_id,
                state.state,
                state.failures
            );
        }
        self.store.save(webhook_id, &state).await?;
        Ok(state)
    }

    pub async fn state(&self, webhook_id: Uuid) -> Result<CircuitBreakerState> {
        self.store.load(webhook_id).await
    }

    pub async fn reset(&self, webhook_id: Uuid) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        self.store.remove(webhook_id).await
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
