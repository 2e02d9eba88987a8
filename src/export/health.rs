use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::service::status::StatusCell;
use crate::service::Command;

/// Prometheus metrics for service health and observability.
///
/// All metrics use the "watchoor" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Throughput ===
    /// Total capture files processed to completion.
    pub files_processed: Counter,
    /// Total events folded into the aggregate.
    pub events_processed: Counter,
    /// Pipeline stage failures by stage.
    pub stage_failures: CounterVec,
    /// Events rejected while filling the monitors.
    pub fill_errors: Counter,
    /// Failed catalog polls.
    pub catalog_errors: Counter,

    // === Output ===
    /// Snapshot files persisted.
    pub snapshots_persisted: Counter,
    /// Failed snapshot persistence attempts.
    pub persist_errors: Counter,
    /// Snapshot frames delivered to observers.
    pub snapshots_broadcast: Counter,

    // === State ===
    /// Current service state as a numeric code; /status has the label.
    pub service_status: Gauge,
    /// Run id currently being aggregated.
    pub current_run: Gauge,
    /// Forced-rollover suffix for the next snapshot write.
    pub current_sub_run: Gauge,
    /// Events aggregated in the current run.
    pub events_in_run: Gauge,
    /// Connected broadcast clients by role.
    pub connected_clients: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Throughput ===
        let files_processed = Counter::with_opts(
            Opts::new(
                "files_processed_total",
                "Total capture files processed to completion.",
            )
            .namespace("watchoor"),
        )?;
        let events_processed = Counter::with_opts(
            Opts::new(
                "events_processed_total",
                "Total events folded into the aggregate.",
            )
            .namespace("watchoor"),
        )?;
        let stage_failures = CounterVec::new(
            Opts::new("stage_failures_total", "Pipeline stage failures by stage.")
                .namespace("watchoor"),
            &["stage"],
        )?;
        let fill_errors = Counter::with_opts(
            Opts::new(
                "fill_errors_total",
                "Events rejected while filling the monitors.",
            )
            .namespace("watchoor"),
        )?;
        let catalog_errors = Counter::with_opts(
            Opts::new("catalog_errors_total", "Failed catalog polls.").namespace("watchoor"),
        )?;

        // === Output ===
        let snapshots_persisted = Counter::with_opts(
            Opts::new("snapshots_persisted_total", "Snapshot files persisted.")
                .namespace("watchoor"),
        )?;
        let persist_errors = Counter::with_opts(
            Opts::new(
                "persist_errors_total",
                "Failed snapshot persistence attempts.",
            )
            .namespace("watchoor"),
        )?;
        let snapshots_broadcast = Counter::with_opts(
            Opts::new(
                "snapshots_broadcast_total",
                "Snapshot frames delivered to observers.",
            )
            .namespace("watchoor"),
        )?;

        // === State ===
        let service_status = Gauge::with_opts(
            Opts::new(
                "service_status",
                "Current service state as a numeric code (0=stopped, 1=waiting).",
            )
            .namespace("watchoor"),
        )?;
        let current_run = Gauge::with_opts(
            Opts::new("current_run", "Run id currently being aggregated.").namespace("watchoor"),
        )?;
        let current_sub_run = Gauge::with_opts(
            Opts::new(
                "current_sub_run",
                "Forced-rollover suffix for the next snapshot write.",
            )
            .namespace("watchoor"),
        )?;
        let events_in_run = Gauge::with_opts(
            Opts::new("events_in_run", "Events aggregated in the current run.")
                .namespace("watchoor"),
        )?;
        let connected_clients = GaugeVec::new(
            Opts::new("connected_clients", "Connected broadcast clients by role.")
                .namespace("watchoor"),
            &["role"],
        )?;

        registry.register(Box::new(files_processed.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(stage_failures.clone()))?;
        registry.register(Box::new(fill_errors.clone()))?;
        registry.register(Box::new(catalog_errors.clone()))?;
        registry.register(Box::new(snapshots_persisted.clone()))?;
        registry.register(Box::new(persist_errors.clone()))?;
        registry.register(Box::new(snapshots_broadcast.clone()))?;
        registry.register(Box::new(service_status.clone()))?;
        registry.register(Box::new(current_run.clone()))?;
        registry.register(Box::new(current_sub_run.clone()))?;
        registry.register(Box::new(events_in_run.clone()))?;
        registry.register(Box::new(connected_clients.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            files_processed,
            events_processed,
            stage_failures,
            fill_errors,
            catalog_errors,
            snapshots_persisted,
            persist_errors,
            snapshots_broadcast,
            service_status,
            current_run,
            current_sub_run,
            events_in_run,
            connected_clients,
        })
    }

    /// Starts the HTTP server serving /metrics, /healthz, /status and
    /// POST /reset.
    pub async fn start(
        &self,
        status: Arc<StatusCell>,
        commands: mpsc::Sender<Command>,
    ) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            status,
            commands,
            current_run: self.current_run.clone(),
            current_sub_run: self.current_sub_run.clone(),
            events_in_run: self.events_in_run.clone(),
            connected_clients: self.connected_clients.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/status", get(status_handler))
            .route("/reset", post(reset_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    status: Arc<StatusCell>,
    commands: mpsc::Sender<Command>,
    current_run: Gauge,
    current_sub_run: Gauge,
    events_in_run: Gauge,
    connected_clients: GaugeVec,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /status - Current service state as JSON.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let observers = state.connected_clients.with_label_values(&["observer"]).get();
    let display = state.connected_clients.with_label_values(&["display"]).get();

    Json(serde_json::json!({
        "status": state.status.get().as_str(),
        "run": state.current_run.get() as i64,
        "sub_run": state.current_sub_run.get() as i64,
        "events_in_run": state.events_in_run.get() as i64,
        "observers": observers as i64,
        "display": display > 0.5,
    }))
}

/// POST /reset - Schedule a forced aggregate rollover.
async fn reset_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.commands.try_send(Command::ForceReset) {
        Ok(()) => (StatusCode::ACCEPTED, "reset scheduled"),
        Err(e) => {
            tracing::warn!(error = %e, "rejecting reset request");
            (StatusCode::SERVICE_UNAVAILABLE, "service not accepting commands")
        }
    }
}
