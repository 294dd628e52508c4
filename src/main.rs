/// contentway server entry point
///
/// Serves:
/// - Workflow and instance API at /api/workflows/*, /api/instances/*, /api/events
/// - Webhook API at /api/webhooks/*
/// - Health check at /healthz

use contentway::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and ./data, overridable through CONTENTWAY_* variables
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
