/// Server setup and initialization
///
/// Wires together all components: storage, registry, scheduler, execution
/// engine, webhook service and HTTP routes.

use crate::{
    api::{
        webhooks::{create_webhook_routes, WebhookAppState},
        workflows::{create_workflow_routes, AppState},
    },
    audit::{Auditor, TracingAuditSink},
    config::Config,
    events::EventBus,
    runtime::{
        engine::ExecutionEngine,
        executor::{ActionRegistry, LogNotificationSender, StepExecutor},
        scheduler::CronJobScheduler,
    },
    storage::{PersistenceGateway, SqliteGateway},
    webhook::{
        batch::InMemoryBatchStore,
        breaker::InMemoryBreakerStore,
        delivery::{ReqwestTransport, WebhookTransport},
        service::WebhookService,
    },
    workflow::registry::WorkflowRegistry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Running core components
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<WorkflowRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub webhooks: Arc<WebhookService>,
    pub scheduler: CronJobScheduler,
    pub events: EventBus,
}

impl Services {
    /// Build and start every component on top of `storage`
    pub async fn start(
        config: &Config,
        storage: Arc<dyn PersistenceGateway>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Result<Self> {
        let events = EventBus::default();
        let auditor = Auditor::new(Arc::new(TracingAuditSink));

        tracing::info!("📊 Initializing workflow registry");
        let registry = Arc::new(WorkflowRegistry::new(
            Arc::clone(&storage),
            auditor.clone(),
            events.clone(),
        ));
        tracing::info!("📥 Loading existing workflows from storage");
        registry
            .init_from_storage()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

        tracing::info!("⏰ Initializing job scheduler");
        let scheduler = CronJobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {}", e))?;
        scheduler.start().await?;

        tracing::info!("🚀 Initializing execution engine");
        let executor = StepExecutor::new(
            Arc::new(LogNotificationSender),
            ActionRegistry::new(),
            Arc::new(scheduler.clone()),
        );
        let engine = ExecutionEngine::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            executor,
            Arc::new(scheduler.clone()),
            events.clone(),
            auditor.clone(),
            config.engine.queue_concurrency,
        );
        engine.init().await?;

        tracing::info!("🪝 Initializing webhook service");
        let webhooks = WebhookService::new(
            storage,
            config.webhooks.clone(),
            Arc::new(InMemoryBreakerStore::new()),
            Arc::new(InMemoryBatchStore::new()),
            transport,
            events.clone(),
            auditor,
        );
        webhooks.init(true).await?;

        Ok(Self {
            registry,
            engine,
            webhooks,
            scheduler,
            events,
        })
    }

    /// Stop accepting work and drain what is in flight
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await?;
        self.engine.shutdown().await;
        self.webhooks.shutdown().await?;
        Ok(())
    }

    pub fn router(&self) -> Router {
        let app_state = AppState {
            registry: Arc::clone(&self.registry),
            engine: Arc::clone(&self.engine),
        };
        let webhook_state = WebhookAppState {
            app_state: app_state.clone(),
            webhooks: Arc::clone(&self.webhooks),
        };

        Router::new()
            .route("/healthz", get(health_check))
            .merge(create_workflow_routes().with_state(app_state))
            .merge(create_webhook_routes().with_state(webhook_state))
    }
}

/// Create the main Axum application with all routes
///
/// Opens the SQLite database under the configured data directory and starts
/// every background component.
pub async fn create_app(config: &Config) -> Result<(Router, Services)> {
    let storage = SqliteGateway::open(&config.database.data_dir).await?;
    let transport = ReqwestTransport::new()?;
    let services = Services::start(config, Arc::new(storage), Arc::new(transport)).await?;

    tracing::info!("✅ Application initialized successfully");
    Ok((services.router(), services))
}

/// Start the HTTP server with the given configuration
///
/// Serves until ctrl-c, then drains the engine and pending webhook deliveries.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting contentway server...");
    let (app, services) = create_app(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("🛑 Shutting down");
    services.shutdown().await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
