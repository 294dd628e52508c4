//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use contentway::{
    audit::{Auditor, TracingAuditSink},
    events::EventBus,
    runtime::{
        engine::ExecutionEngine,
        executor::{ActionRegistry, LogNotificationSender, StepExecutor},
        scheduler::{JobHandler, JobSpec, ScheduledJob, Scheduler},
    },
    storage::{MemoryGateway, PersistenceGateway, SqliteGateway},
    workflow::{registry::WorkflowRegistry, types::Workflow},
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

/// Scheduler double: jobs only run when the test fires them
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<HashMap<Uuid, ScheduledJob>>,
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
}

impl ManualScheduler {
    pub fn pending_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    /// Run every pending job through its handler, returning the handler results
    pub async fn fire_all(&self) -> Vec<anyhow::Result<Value>> {
        let jobs: Vec<ScheduledJob> = self.jobs.lock().unwrap().drain().map(|(_, j)| j).collect();
        let mut results = Vec::new();
        for job in jobs {
            let handler = self.handlers.lock().unwrap().get(&job.name).cloned();
            let handler = handler.expect("no handler registered for job");
            results.push(handler.run(&job).await);
        }
        results
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn create_job(&self, spec: JobSpec) -> anyhow::Result<Uuid> {
        let job = ScheduledJob::new(spec);
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        Ok(id)
    }

    async fn register_job_handler(&self, name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.lock().unwrap().insert(name.to_string(), handler);
    }

    async fn cancel_job(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.jobs.lock().unwrap().remove(&id).is_some())
    }

    async fn get_job(&self, id: Uuid) -> Option<ScheduledJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }
}

pub struct Harness {
    pub storage: Arc<dyn PersistenceGateway>,
    pub registry: Arc<WorkflowRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub scheduler: Arc<ManualScheduler>,
    pub events: EventBus,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_gateway(Arc::new(MemoryGateway::new())).await
    }

    pub async fn sqlite() -> Self {
        Self::with_gateway(Arc::new(SqliteGateway::in_memory().await.unwrap())).await
    }

    pub async fn with_gateway(storage: Arc<dyn PersistenceGateway>) -> Self {
        let gateway = Arc::clone(&storage);
        let events = EventBus::default();
        let auditor = Auditor::new(Arc::new(TracingAuditSink));
        let scheduler = Arc::new(ManualScheduler::default());

        let registry = Arc::new(WorkflowRegistry::new(
            Arc::clone(&gateway),
            auditor.clone(),
            events.clone(),
        ));
        let executor = StepExecutor::new(
            Arc::new(LogNotificationSender),
            ActionRegistry::new(),
            scheduler.clone(),
        );
        let engine = ExecutionEngine::new(
            gateway,
            Arc::clone(&registry),
            executor,
            scheduler.clone(),
            events.clone(),
            auditor,
            4,
        );
        engine.init().await.unwrap();

        Self {
            storage,
            registry,
            engine,
            scheduler,
            events,
        }
    }

    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.engine.wait_idle())
            .await
            .expect("engine did not become idle");
    }
}

pub fn approval(id: &str, order: i32, next: &[&str]) -> Value {
    json!({
        "id": id,
        "name": id,
        "type": "APPROVAL",
        "config": {"approvers": ["editor"]},
        "nextSteps": next,
        "order": order,
    })
}

pub fn workflow(id: &str, start: &str, steps: Vec<Value>) -> Workflow {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("{} workflow", id),
        "status": "ACTIVE",
        "startStepId": start,
        "steps": steps,
    }))
    .unwrap()
}
