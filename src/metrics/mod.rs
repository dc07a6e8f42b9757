use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Cycle metrics
    pub static ref UPDATE_RUN_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "crosswind_update_run_seconds",
            "Time spent processing updates"
        ).buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0])
    ).unwrap();

    pub static ref SERVICE_UPDATED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "crosswind_service_updated_total",
            "Shows if a service has been updated"
        ),
        &["name", "id", "short_id", "image"]
    ).unwrap();

    pub static ref STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("crosswind_state", "The current state of crosswind"),
        &["crosswind_state"]
    ).unwrap();

    pub static ref INFO: IntGaugeVec = IntGaugeVec::new(
        Opts::new("crosswind_info", "Information about crosswind"),
        &["version"]
    ).unwrap();

    // Collaborator metrics
    pub static ref REGISTRY_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "crosswind_registry_errors_total",
        "Total number of failed registry digest lookups"
    ).unwrap();

    pub static ref UPDATES_FAILED_TOTAL: IntCounter = IntCounter::new(
        "crosswind_updates_failed_total",
        "Total number of update requests rejected by the orchestrator"
    ).unwrap();

    // Notification metrics
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounter = IntCounter::new(
        "crosswind_notifications_sent_total",
        "Total number of notifications sent"
    ).unwrap();

    pub static ref NOTIFICATIONS_FAILED_TOTAL: IntCounter = IntCounter::new(
        "crosswind_notifications_failed_total",
        "Total number of failed notification attempts"
    ).unwrap();

    // Webhook metrics
    pub static ref WEBHOOKS_SENT_TOTAL: IntCounter = IntCounter::new(
        "crosswind_webhooks_sent_total",
        "Total number of per-workload webhooks delivered"
    ).unwrap();

    pub static ref WEBHOOKS_FAILED_TOTAL: IntCounter = IntCounter::new(
        "crosswind_webhooks_failed_total",
        "Total number of per-workload webhooks that failed"
    ).unwrap();
}

/// Values of the `crosswind_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Sleeping,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
        }
    }
}

pub fn register_metrics() {
    REGISTRY.register(Box::new(UPDATE_RUN_SECONDS.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_UPDATED.clone())).ok();
    REGISTRY.register(Box::new(STATE.clone())).ok();
    REGISTRY.register(Box::new(INFO.clone())).ok();
    REGISTRY
        .register(Box::new(REGISTRY_ERRORS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(UPDATES_FAILED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_FAILED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(WEBHOOKS_SENT_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(WEBHOOKS_FAILED_TOTAL.clone()))
        .ok();

    info!("Metrics registered");
}

/// Publish the static build information.
pub fn set_build_info(version: &str) {
    INFO.with_label_values(&[version]).set(1);
}

/// Flip the state gauge so exactly one state reads 1.
pub fn set_state(state: RunState) {
    for candidate in [RunState::Running, RunState::Sleeping] {
        STATE
            .with_label_values(&[candidate.as_str()])
            .set(i64::from(candidate == state));
    }
}

/// Labels for one workload's update counter.
pub struct ServiceLabels<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub short_id: &'a str,
    pub image: &'a str,
}

impl ServiceLabels<'_> {
    fn values(&self) -> [&str; 4] {
        [self.name, self.id, self.short_id, self.image]
    }
}

/// Make sure the series exists even if the workload never updates.
pub fn register_service(labels: &ServiceLabels<'_>) {
    SERVICE_UPDATED.with_label_values(&labels.values()).inc_by(0);
}

pub fn record_service_update(labels: &ServiceLabels<'_>) {
    SERVICE_UPDATED.with_label_values(&labels.values()).inc();
}

pub fn service_update_count(labels: &ServiceLabels<'_>) -> u64 {
    SERVICE_UPDATED.with_label_values(&labels.values()).get()
}

pub async fn start_metrics_server(port: u16) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    info!("Listening on port {}", port);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server failed: {}", e);
        }
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buffer,
    )
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_gauge_is_exclusive() {
        set_state(RunState::Running);
        assert_eq!(STATE.with_label_values(&["running"]).get(), 1);
        assert_eq!(STATE.with_label_values(&["sleeping"]).get(), 0);

        set_state(RunState::Sleeping);
        assert_eq!(STATE.with_label_values(&["running"]).get(), 0);
        assert_eq!(STATE.with_label_values(&["sleeping"]).get(), 1);
    }

    #[test]
    fn test_register_service_starts_at_zero() {
        let labels = ServiceLabels {
            name: "metrics-test-never-updated",
            id: "id-1",
            short_id: "id1",
            image: "nginx",
        };
        register_service(&labels);
        assert_eq!(service_update_count(&labels), 0);

        record_service_update(&labels);
        assert_eq!(service_update_count(&labels), 1);
    }

    #[test]
    fn test_registered_metrics_are_exposed() {
        register_metrics();
        set_build_info("0.0.0-test");

        let mut buffer = vec![];
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let exposed = String::from_utf8(buffer).unwrap();
        assert!(exposed.contains("crosswind_info{version=\"0.0.0-test\"} 1"));
    }
}
