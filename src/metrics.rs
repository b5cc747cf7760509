use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric name prefix for all worker metrics
const PREFIX: &str = "notification_worker";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref DELIVERIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_deliveries_total"), "Queue deliveries by outcome"),
        &["outcome"]
    ).expect("Failed to create deliveries_total metric");

    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_delivery_duration_seconds"),
            "Time from receiving a delivery to settling it"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["outcome"]
    ).expect("Failed to create delivery_duration_seconds metric");

    pub static ref DEAD_LETTER_PUBLISH_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_dead_letter_publish_failures_total"),
        "Dead-letter publishes that were not confirmed"
    ).expect("Failed to create dead_letter_publish_failures_total metric");

    pub static ref SETTLE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_settle_failures_total"), "Failed ack/nack calls"),
        &["action"]
    ).expect("Failed to create settle_failures_total metric");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_depth"), "Ready messages per queue"),
        &["queue"]
    ).expect("Failed to create queue_depth metric");
}

/// Initialize all metrics by registering them with the registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERY_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(DEAD_LETTER_PUBLISH_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SETTLE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_DEPTH.clone()));
}

/// Record a settled delivery
pub fn record_delivery(outcome: &str, duration: Duration) {
    DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
    DELIVERY_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn record_dead_letter_publish_failure() {
    DEAD_LETTER_PUBLISH_FAILURES_TOTAL.inc();
}

/// Record a failed ack or nack
pub fn record_settle_failure(action: &str) {
    SETTLE_FAILURES_TOTAL.with_label_values(&[action]).inc();
}

pub fn set_queue_depth(queue: &str, ready: usize) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(ready as i64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` on `port` until `shutdown` is cancelled.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics available at port {}!", port);

    axum::serve(listener, make_metrics_app())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
