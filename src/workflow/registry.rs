/// Workflow definition store with hot-reload registry
///
/// Definitions are persisted through the gateway and served from an in-memory
/// catalog swapped atomically with ArcSwap. Reads never block; writes are
/// serialized so the default-workflow uniqueness check cannot race.
/// Every version ever created stays addressable for the instances pinned to it.

use crate::{
    audit::{AuditEntry, Auditor},
    error::{ApiError, ApiResult},
    events::{self, EventBus},
    storage::PersistenceGateway,
    workflow::{
        types::{Workflow, WorkflowStatus},
        validation::validate_workflow,
    },
};
use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Utc;
use petgraph::{graph::DiGraph, visit::Dfs};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Compiled workflow with execution metadata
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Base workflow definition
    pub workflow: Arc<Workflow>,
    /// Steps that cannot be reached from the start step
    pub unreachable_steps: Vec<String>,
}

impl CompiledWorkflow {
    pub fn compile(workflow: Workflow) -> Self {
        let unreachable_steps = unreachable_steps(&workflow);
        if !unreachable_steps.is_empty() {
            tracing::warn!(
                "⚠️ Workflow '{}' v{} has unreachable steps: {:?}",
                workflow.id,
                workflow.version,
                unreachable_steps
            );
        }
        Self {
            workflow: Arc::new(workflow),
            unreachable_steps,
        }
    }
}

/// Walk the step graph from the start step and report every step never visited
fn unreachable_steps(workflow: &Workflow) -> Vec<String> {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, _> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &workflow.steps {
        for next in &step.next_steps {
            if let (Some(&from), Some(&to)) = (index.get(step.id.as_str()), index.get(next.as_str())) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let Some(&start) = index.get(workflow.start_step_id.as_str()) else {
        return workflow.steps.iter().map(|s| s.id.clone()).collect();
    };

    let mut reached = vec![false; graph.node_count()];
    let mut dfs = Dfs::new(&graph, start);
    while let Some(node) = dfs.next(&graph) {
        reached[node.index()] = true;
    }

    workflow
        .steps
        .iter()
        .filter(|s| !index.get(s.id.as_str()).is_some_and(|n| reached[n.index()]))
        .map(|s| s.id.clone())
        .collect()
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    /// workflow_id -> latest version
    latest: HashMap<String, u32>,
    /// (workflow_id, version) -> compiled definition
    versions: HashMap<(String, u32), CompiledWorkflow>,
}

impl Catalog {
    fn latest(&self, id: &str) -> Option<&CompiledWorkflow> {
        let version = *self.latest.get(id)?;
        self.versions.get(&(id.to_string(), version))
    }

    fn insert(&mut self, compiled: CompiledWorkflow) {
        let id = compiled.workflow.id.clone();
        let version = compiled.workflow.version;
        let newest = self.latest.get(&id).map_or(version, |v| (*v).max(version));
        self.latest.insert(id.clone(), newest);
        self.versions.insert((id, version), compiled);
    }
}

/// Lock-free workflow registry for hot-reload capabilities
pub struct WorkflowRegistry {
    catalog: ArcSwap<Catalog>,
    /// Serializes writers
    write_lock: Mutex<()>,
    storage: Arc<dyn PersistenceGateway>,
    auditor: Auditor,
    events: EventBus,
}

impl WorkflowRegistry {
    pub fn new(storage: Arc<dyn PersistenceGateway>, auditor: Auditor, events: EventBus) -> Self {
        Self {
            catalog: ArcSwap::new(Arc::new(Catalog::default())),
            write_lock: Mutex::new(()),
            storage,
            auditor,
            events,
        }
    }

    /// Initialize registry by loading the latest version of every workflow
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.list_workflows().await?;
        let mut catalog = Catalog::default();
        for workflow in stored {
            catalog.insert(CompiledWorkflow::compile(workflow));
        }
        self.catalog.store(Arc::new(catalog));

        tracing::info!(
            "📊 Initialized workflow registry with {} workflows",
            self.catalog.load().latest.len()
        );
        Ok(())
    }

    /// Latest version of a workflow (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.catalog.load().latest(workflow_id).cloned()
    }

    /// A specific version, falling back to storage for versions not yet cached
    pub async fn get_workflow_version(
        &self,
        workflow_id: &str,
        version: u32,
    ) -> Result<Option<CompiledWorkflow>> {
        let key = (workflow_id.to_string(), version);
        if let Some(compiled) = self.catalog.load().versions.get(&key) {
            return Ok(Some(compiled.clone()));
        }

        let Some(workflow) = self.storage.get_workflow_version(workflow_id, version).await? else {
            return Ok(None);
        };
        let compiled = CompiledWorkflow::compile(workflow);
        self.catalog.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(compiled.clone());
            next
        });
        Ok(Some(compiled))
    }

    /// Latest version of every workflow
    pub fn list_workflows(&self) -> Vec<Arc<Workflow>> {
        let catalog = self.catalog.load();
        let mut workflows: Vec<Arc<Workflow>> = catalog
            .latest
            .keys()
            .filter_map(|id| catalog.latest(id))
            .map(|c| Arc::clone(&c.workflow))
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    /// Active workflows bound to an event type
    pub fn find_for_trigger(
        &self,
        event_type: &str,
        content_type_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Vec<Arc<Workflow>> {
        self.list_workflows()
            .into_iter()
            .filter(|wf| wf.matches_trigger(event_type, content_type_id, tenant_id))
            .collect()
    }

    /// Validate, persist and register a new workflow (version 1)
    pub async fn create_workflow(&self, mut workflow: Workflow, user_id: Option<&str>) -> ApiResult<Workflow> {
        let _guard = self.write_lock.lock().await;

        if workflow.id.trim().is_empty() {
            workflow.id = uuid::Uuid::new_v4().to_string();
        }
        validate_workflow(&workflow)?;
        if self.get_workflow(&workflow.id).is_some() {
            return Err(ApiError::conflict(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        self.ensure_single_default(&workflow)?;

        let now = Utc::now();
        workflow.version = 1;
        workflow.created_at = now;
        workflow.updated_at = now;
        workflow.steps.sort_by_key(|s| s.order);
        for (i, trigger) in workflow.triggers.iter_mut().enumerate() {
            if trigger.id.is_empty() {
                trigger.id = format!("{}-trigger-{}", workflow.id, i + 1);
            }
        }

        self.storage.create_workflow(&workflow).await?;
        self.register(workflow.clone());

        tracing::info!("🔥 Created workflow: {} ({})", workflow.id, workflow.name);
        self.auditor.record(
            AuditEntry::new("workflow.create", "workflow", &workflow.id)
                .user(user_id)
                .tenant(workflow.tenant_id.as_deref())
                .details(json!({"name": workflow.name, "steps": workflow.steps.len()})),
        );
        self.events.emit(
            events::WORKFLOW_CREATED,
            workflow.tenant_id.clone(),
            json!({"workflowId": workflow.id, "name": workflow.name}),
        );
        Ok(workflow)
    }

    /// Store a new version of an existing workflow
    ///
    /// Instances already running keep executing the version they were created with.
    pub async fn update_workflow(
        &self,
        workflow_id: &str,
        mut workflow: Workflow,
        user_id: Option<&str>,
    ) -> ApiResult<Workflow> {
        let _guard = self.write_lock.lock().await;

        let current = self
            .get_workflow(workflow_id)
            .ok_or_else(|| ApiError::not_found("workflow", workflow_id))?;

        workflow.id = workflow_id.to_string();
        validate_workflow(&workflow)?;
        self.ensure_single_default(&workflow)?;

        workflow.version = current.workflow.version + 1;
        workflow.created_at = current.workflow.created_at;
        workflow.updated_at = Utc::now();
        workflow.steps.sort_by_key(|s| s.order);

        self.storage.update_workflow(&workflow).await?;
        self.register(workflow.clone());

        tracing::info!(
            "🔥 Hot-reloaded workflow: {} ({}) now at v{}",
            workflow.id,
            workflow.name,
            workflow.version
        );
        self.auditor.record(
            AuditEntry::new("workflow.update", "workflow", &workflow.id)
                .user(user_id)
                .tenant(workflow.tenant_id.as_deref())
                .details(json!({"version": workflow.version})),
        );
        self.events.emit(
            events::WORKFLOW_UPDATED,
            workflow.tenant_id.clone(),
            json!({"workflowId": workflow.id, "version": workflow.version}),
        );
        Ok(workflow)
    }

    /// Archive a workflow: new version with status ARCHIVED
    pub async fn archive_workflow(&self, workflow_id: &str, user_id: Option<&str>) -> ApiResult<Workflow> {
        let mut workflow = self
            .get_workflow(workflow_id)
            .map(|c| (*c.workflow).clone())
            .ok_or_else(|| ApiError::not_found("workflow", workflow_id))?;
        workflow.status = WorkflowStatus::Archived;
        workflow.is_default = false;
        self.update_workflow(workflow_id, workflow, user_id).await
    }

    fn register(&self, workflow: Workflow) {
        let compiled = CompiledWorkflow::compile(workflow);
        self.catalog.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(compiled.clone());
            next
        });
    }

    /// At most one non-archived default per (content type, tenant)
    fn ensure_single_default(&self, workflow: &Workflow) -> ApiResult<()> {
        let Some(content_type) = workflow.content_type_id.as_deref() else {
            return Ok(());
        };
        if !workflow.is_default || workflow.status == WorkflowStatus::Archived {
            return Ok(());
        }

        let holder = self.list_workflows().into_iter().find(|other| {
            other.id != workflow.id
                && other.is_default
                && other.status != WorkflowStatus::Archived
                && other.content_type_id.as_deref() == Some(content_type)
                && other.tenant_id == workflow.tenant_id
        });

        match holder {
            Some(other) => Err(ApiError::conflict(format!(
                "workflow '{}' is already the default for content type '{}'",
                other.name, content_type
            ))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.catalog.load().latest.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audit::TracingAuditSink, storage::MemoryGateway};
    use serde_json::Value;

    fn registry() -> WorkflowRegistry {
        WorkflowRegistry::new(
            Arc::new(MemoryGateway::new()),
            Auditor::new(Arc::new(TracingAuditSink)),
            EventBus::default(),
        )
    }

    fn definition(id: &str, extra: Value) -> Workflow {
        let mut base = json!({
            "id": id, "name": format!("{} flow", id), "status": "ACTIVE", "startStepId": "a",
            "steps": [
                {"id": "a", "type": "APPROVAL", "config": {"approvers": ["ed"]}, "nextSteps": ["b"], "order": 1},
                {"id": "b", "type": "APPROVAL", "config": {"approvers": ["chief"]}, "order": 2}
            ]
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(base).unwrap()
    }

    #[tokio::test]
    async fn second_default_for_same_content_type_conflicts() {
        let registry = registry();
        let defaults = json!({"isDefault": true, "contentTypeId": "article", "tenantId": "t1"});
        registry
            .create_workflow(definition("first", defaults.clone()), None)
            .await
            .unwrap();

        let err = registry
            .create_workflow(definition("second", defaults), None)
            .await
            .unwrap_err();
        match err {
            ApiError::Conflict(msg) => assert!(msg.contains("first flow"), "{}", msg),
            other => panic!("expected conflict, got {:?}", other),
        }

        // Other tenant is free to have its own default
        registry
            .create_workflow(
                definition("third", json!({"isDefault": true, "contentTypeId": "article", "tenantId": "t2"})),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn archived_default_frees_the_slot() {
        let registry = registry();
        let defaults = json!({"isDefault": true, "contentTypeId": "page"});
        registry.create_workflow(definition("old", defaults.clone()), None).await.unwrap();
        registry.archive_workflow("old", Some("admin")).await.unwrap();
        registry.create_workflow(definition("new", defaults), None).await.unwrap();
    }

    #[tokio::test]
    async fn update_bumps_version_and_keeps_old_one() {
        let registry = registry();
        registry.create_workflow(definition("wf", json!({})), None).await.unwrap();

        let mut changed = definition("wf", json!({}));
        changed.name = "renamed".into();
        let updated = registry.update_workflow("wf", changed, None).await.unwrap();
        assert_eq!(updated.version, 2);

        let v1 = registry.get_workflow_version("wf", 1).await.unwrap().unwrap();
        assert_eq!(v1.workflow.name, "wf flow");
        assert_eq!(registry.get_workflow("wf").unwrap().workflow.name, "renamed");
    }

    #[tokio::test]
    async fn create_rejects_invalid_and_duplicate() {
        let registry = registry();
        let mut bad = definition("bad", json!({}));
        bad.start_step_id = "nope".into();
        assert!(matches!(
            registry.create_workflow(bad, None).await,
            Err(ApiError::Validation(_))
        ));

        registry.create_workflow(definition("dup", json!({})), None).await.unwrap();
        assert!(matches!(
            registry.create_workflow(definition("dup", json!({})), None).await,
            Err(ApiError::Conflict(_))
        ));
        assert!(matches!(
            registry.update_workflow("ghost", definition("ghost", json!({})), None).await,
            Err(ApiError::NotFound { .. })
        ));
    }

    #[test]
    fn unreachable_steps_are_reported() {
        let mut wf = definition("wf", json!({}));
        wf.steps[0].next_steps.clear();
        let compiled = CompiledWorkflow::compile(wf);
        assert_eq!(compiled.unreachable_steps, vec!["b".to_string()]);
    }
}
