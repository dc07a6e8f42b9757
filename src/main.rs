use anyhow::{Context, Result};
use crosswind::config::Config;
use crosswind::metrics;
use crosswind::notifications::{NotificationManager, NotificationPayload};
use crosswind::orchestrator::KubeOrchestrator;
use crosswind::reconciler::Reconciler;
use crosswind::registry::{OciRegistry, auth::AuthManager};
use crosswind::scheduler;
use crosswind::webhook::WebhookDispatcher;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "crosswind=info,kube=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting crosswind {}", VERSION);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        },
    };

    metrics::set_build_info(VERSION);
    let metrics_handle = metrics::start_metrics_server(config.prometheus_port).await?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let orchestrator = Arc::new(KubeOrchestrator::new(
        client.clone(),
        config.namespace.clone(),
    ));
    let registry = Arc::new(OciRegistry::with_auth(AuthManager::new(client)));
    let notifications = NotificationManager::new(&config.notifications);

    let reconciler = Reconciler::new(
        orchestrator,
        registry,
        notifications,
        WebhookDispatcher::new()?,
        config.reconciler.clone(),
    );

    reconciler
        .notifications()
        .notify(
            NotificationPayload::new("Startup")
                .with_message(format!("Starting **crosswind {}**", VERSION)),
        )
        .await;

    info!("crosswind is running");

    tokio::select! {
        _ = scheduler::run(&config.schedule, &reconciler) => info!("Scheduler stopped"),
        _ = metrics_handle => info!("Metrics server stopped"),
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }

    Ok(())
}
