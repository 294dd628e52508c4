/// SQLite persistence layer
///
/// Every record is stored as a JSON body for flexibility, next to the few
/// columns the gateway filters on (status, current step, owning ids).
/// Instance transitions run inside a transaction and the final UPDATE repeats
/// the guard in its WHERE clause, so two racing writers cannot both advance
/// the same step.

use crate::{
    storage::PersistenceGateway,
    webhook::types::{Webhook, WebhookDelivery},
    workflow::types::{
        InstanceStepPatch, InstanceTransition, TransitionGuard, Workflow, WorkflowInstance,
        WorkflowInstanceStep,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row, SqliteConnection,
};
use std::path::Path;
use uuid::Uuid;

/// SQLite-based persistence gateway
#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    /// Create gateway over an existing pool; call `init_schema` before use
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) `contentway.db` inside `data_dir` and initialize the schema
    pub async fn open(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
        let db_path = Path::new(data_dir).join("contentway.db");

        tracing::info!("🗄️ Opening database: {}", db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let gateway = Self::new(pool);
        gateway.init_schema().await?;
        Ok(gateway)
    }

    /// Private in-memory database (single connection so every query sees the same data)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let gateway = Self::new(pool);
        gateway.init_schema().await?;
        Ok(gateway)
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step_id TEXT,
                body JSON NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instance_steps (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                body JSON NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                secret TEXT,
                body JSON NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id TEXT PRIMARY KEY,
                webhook_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                body JSON NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_instances_workflow ON workflow_instances(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_instance_steps_instance ON workflow_instance_steps(instance_id, step_id)",
            "CREATE INDEX IF NOT EXISTS idx_deliveries_webhook ON webhook_deliveries(webhook_id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn status_text<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(anyhow::anyhow!("status did not serialize to a string: {}", other)),
    }
}

async fn insert_step(conn: &mut SqliteConnection, step: &WorkflowInstanceStep) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_instance_steps (id, instance_id, step_id, body) VALUES (?, ?, ?, ?)",
    )
    .bind(step.id.to_string())
    .bind(step.instance_id.to_string())
    .bind(&step.step_id)
    .bind(serde_json::to_string(step)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn patch_latest_step(
    conn: &mut SqliteConnection,
    instance_id: Uuid,
    step_id: &str,
    patch: &InstanceStepPatch,
) -> Result<()> {
    let row = sqlx::query(
        r#"
        SELECT id, body FROM workflow_instance_steps
        WHERE instance_id = ? AND step_id = ?
        ORDER BY rowid DESC LIMIT 1
        "#,
    )
    .bind(instance_id.to_string())
    .bind(step_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(());
    };
    let row_id: String = row.get("id");
    let body: String = row.get("body");
    let mut step: WorkflowInstanceStep = serde_json::from_str(&body)?;
    step.apply(patch);

    sqlx::query("UPDATE workflow_instance_steps SET body = ? WHERE id = ?")
        .bind(serde_json::to_string(&step)?)
        .bind(row_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_instance(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<WorkflowInstance>> {
    let row = sqlx::query("SELECT body FROM workflow_instances WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let body: String = row.get("body");
            Ok(Some(serde_json::from_str(&body)?))
        }
        None => Ok(None),
    }
}

fn webhook_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Webhook> {
    let body: String = row.get("body");
    let mut webhook: Webhook = serde_json::from_str(&body)?;
    webhook.secret = row.get("secret");
    Ok(webhook)
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        let existing = sqlx::query("SELECT 1 FROM workflows WHERE id = ? LIMIT 1")
            .bind(&workflow.id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            anyhow::bail!("workflow already exists: {}", workflow.id);
        }
        self.update_workflow(workflow).await
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, version, name, status, definition)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id, version) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                definition = excluded.definition
            "#,
        )
        .bind(&workflow.id)
        .bind(workflow.version as i64)
        .bind(&workflow.name)
        .bind(status_text(&workflow.status)?)
        .bind(serde_json::to_string(workflow)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT definition FROM workflows WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn get_workflow_version(&self, id: &str, version: u32) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(
            r#"
            SELECT w.definition FROM workflows w
            WHERE w.version = (SELECT MAX(version) FROM workflows WHERE id = w.id)
            ORDER BY w.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: String = row.get("definition");
            workflows.push(serde_json::from_str(&definition)?);
        }
        Ok(workflows)
    }

    async fn find_active_workflows_for_trigger(
        &self,
        event_type: &str,
        content_type_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Workflow>> {
        Ok(self
            .list_workflows()
            .await?
            .into_iter()
            .filter(|wf| wf.matches_trigger(event_type, content_type_id, tenant_id))
            .collect())
    }

    async fn create_instance(
        &self,
        instance: &WorkflowInstance,
        first_step: &WorkflowInstanceStep,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (id, workflow_id, status, current_step_id, body)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.workflow_id)
        .bind(instance.status.as_str())
        .bind(instance.current_step_id.as_deref())
        .bind(serde_json::to_string(instance)?)
        .execute(&mut *tx)
        .await?;
        insert_step(&mut tx, first_step).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        let mut conn = self.pool.acquire().await?;
        load_instance(&mut conn, id).await
    }

    async fn transition_instance(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        transition: &InstanceTransition,
    ) -> Result<Option<WorkflowInstance>> {
        let mut tx = self.pool.begin().await?;

        let Some(before) = load_instance(&mut tx, id).await? else {
            return Ok(None);
        };
        if !guard.admits(&before) {
            return Ok(None);
        }

        let mut after = before.clone();
        transition.patch.apply(&mut after);

        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?, current_step_id = ?, body = ?
            WHERE id = ? AND status = ? AND current_step_id IS ?
            "#,
        )
        .bind(after.status.as_str())
        .bind(after.current_step_id.as_deref())
        .bind(serde_json::to_string(&after)?)
        .bind(id.to_string())
        .bind(before.status.as_str())
        .bind(before.current_step_id.as_deref())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        if let Some((step_id, patch)) = &transition.step_update {
            patch_latest_step(&mut tx, id, step_id, patch).await?;
        }
        if let Some(new_step) = &transition.new_step {
            insert_step(&mut tx, new_step).await?;
        }

        tx.commit().await?;
        Ok(Some(after))
    }

    async fn list_instance_steps(&self, instance_id: Uuid) -> Result<Vec<WorkflowInstanceStep>> {
        let rows = sqlx::query(
            "SELECT body FROM workflow_instance_steps WHERE instance_id = ? ORDER BY rowid",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            steps.push(serde_json::from_str(&body)?);
        }
        Ok(steps)
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query("INSERT INTO webhooks (id, secret, body, created_at) VALUES (?, ?, ?, ?)")
            .bind(webhook.id.to_string())
            .bind(webhook.secret.as_deref())
            .bind(serde_json::to_string(webhook)?)
            .bind(webhook.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<()> {
        let result = sqlx::query("UPDATE webhooks SET secret = ?, body = ? WHERE id = ?")
            .bind(webhook.secret.as_deref())
            .bind(serde_json::to_string(webhook)?)
            .bind(webhook.id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("webhook not found: {}", webhook.id);
        }
        Ok(())
    }

    async fn delete_webhook(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        let row = sqlx::query("SELECT secret, body FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let rows = sqlx::query("SELECT secret, body FROM webhooks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries (id, webhook_id, success, body) VALUES (?, ?, ?, ?)",
        )
        .bind(delivery.id.to_string())
        .bind(delivery.webhook_id.to_string())
        .bind(delivery.success)
        .bind(serde_json::to_string(delivery)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_deliveries(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            "SELECT body FROM webhook_deliveries WHERE webhook_id = ? ORDER BY rowid DESC LIMIT ?",
        )
        .bind(webhook_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            deliveries.push(serde_json::from_str(&body)?);
        }
        Ok(deliveries)
    }
}
