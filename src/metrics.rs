//! Prometheus metrics for the scheduler and delivery workers.
//!
//! Initialize once at startup and hand clones to the components:
//! ```ignore
//! let metrics = sand::metrics::init()?;
//! sand::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder, core::Collector};
use tokio::sync::watch;
use tracing::{debug, error};

/// Metrics handle containing all instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Scheduler
    scheduler_ticks: Counter,
    scheduler_tick_errors: Counter,
    scheduler_last_tick_elapsed_ms: Gauge,

    // Delivery worker
    timers_processed: Counter,
    timers_remote_error: Counter,
    timers_internal_error: Counter,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_scheduler_tick_started(&self) {
        self.scheduler_ticks.inc();
    }

    pub fn record_scheduler_tick_elapsed(&self, elapsed: Duration) {
        self.scheduler_last_tick_elapsed_ms
            .set(elapsed.as_micros() as f64 / 1000.0);
    }

    pub fn record_scheduler_tick_error(&self) {
        self.scheduler_tick_errors.inc();
    }

    /// Count a timer the worker finished handling, whatever the outcome.
    pub fn record_timer_processed(&self) {
        self.timers_processed.inc();
    }

    pub fn record_remote_error(&self) {
        self.timers_remote_error.inc();
    }

    pub fn record_internal_error(&self) {
        self.timers_internal_error.inc();
    }

    pub fn scheduler_ticks(&self) -> u64 {
        self.scheduler_ticks.get() as u64
    }

    pub fn scheduler_tick_errors(&self) -> u64 {
        self.scheduler_tick_errors.get() as u64
    }

    pub fn scheduler_last_tick_elapsed_ms(&self) -> f64 {
        self.scheduler_last_tick_elapsed_ms.get()
    }

    pub fn timers_processed(&self) -> u64 {
        self.timers_processed.get() as u64
    }

    pub fn timers_remote_error(&self) -> u64 {
        self.timers_remote_error.get() as u64
    }

    pub fn timers_internal_error(&self) -> u64 {
        self.timers_internal_error.get() as u64
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Create a metrics handle backed by a fresh registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let scheduler_ticks = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sand_scheduler_ticks_total",
            "Scheduler ticks started",
        ))?,
    );
    let scheduler_tick_errors = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sand_scheduler_tick_errors_total",
            "Scheduler ticks that failed or overran their deadline",
        ))?,
    );
    let scheduler_last_tick_elapsed_ms = register(
        &registry,
        Gauge::with_opts(Opts::new(
            "sand_scheduler_last_tick_elapsed_ms",
            "Wall time of the most recent completed scheduler tick",
        ))?,
    );
    let timers_processed = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sand_worker_timers_processed_total",
            "Timers handled by delivery workers",
        ))?,
    );
    let timers_remote_error = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sand_worker_timers_remote_error_total",
            "Deliveries rejected by the remote endpoint",
        ))?,
    );
    let timers_internal_error = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sand_worker_timers_internal_error_total",
            "Deliveries that failed before reaching the remote endpoint",
        ))?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        scheduler_ticks,
        scheduler_tick_errors,
        scheduler_last_tick_elapsed_ms,
        timers_processed,
        timers_remote_error,
        timers_internal_error,
    })
}

/// Render every registered metric in the Prometheus text format.
pub fn render(metrics: &Metrics) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metrics.registry.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match render(&metrics) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Serve `/metrics` until the shutdown flag flips.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
