//! Chainwatch agent - threat classification and attack-chain correlation
//!
//! Accepts security events over HTTP, classifies them, and correlates the
//! verdicts into ATT&CK attack chains.

use anyhow::{Context, Result};
use chainwatch::{api, config::AgentConfig};
use chainwatch_lib::{
    correlation::{LogAlertDispatcher, RuleSet},
    store::{EventStore, JsonlEventStore, MemoryEventStore},
    ThreatService,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting chainwatch-agent");

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, api_port = config.api_port, "Agent configured");

    let rules = match &config.rules_path {
        Some(path) => RuleSet::load(path)
            .with_context(|| format!("Failed to load rules from {}", path.display()))?,
        None => RuleSet::default(),
    };

    let store: Arc<dyn EventStore> = match &config.event_store_path {
        Some(path) => Arc::new(JsonlEventStore::new(path)),
        None => {
            warn!("No event store path configured, records are kept in memory only");
            Arc::new(MemoryEventStore::new())
        }
    };

    let service = Arc::new(
        ThreatService::builder(config.service_config())
            .node_name(&config.node_name)
            .rules(rules)
            .event_store(store)
            .alerts(Arc::new(LogAlertDispatcher))
            .build()
            .await,
    );

    for (name, e) in service.load_models(&config.models).await {
        error!(model = %name, error = %e, "Model failed to load");
    }

    let logger = service.logger().clone();
    logger.log_startup(
        AGENT_VERSION,
        service.list_models().len(),
        service.engine().rules().len(),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let workers = service.spawn_workers(&shutdown_tx);

    let app_state = Arc::new(api::AppState::new(service.clone()));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    // Mark agent as ready after initialization
    service.health().set_ready(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");
    service.health().set_ready(false).await;

    let _ = shutdown_tx.send(());
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker exited abnormally");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task exited abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
