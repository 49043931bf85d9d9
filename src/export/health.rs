use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "asnstats";

/// Prometheus metrics for one aggregation run.
///
/// All metrics use the "asnstats" namespace. Served over HTTP while the run
/// lasts when an address is configured, and/or dumped as a textfile at exit.
pub struct PipelineMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Batches handed to a worker, by pass.
    pub batches_dispatched: IntCounterVec,
    /// Batches whose query failed and were skipped, by pass.
    pub batch_failures: IntCounterVec,
    /// Per-batch query duration, by pass.
    pub batch_query_duration: HistogramVec,
    /// Wall time of the last completed pass, by pass.
    pub pass_duration: GaugeVec,
    /// Non-reserved ASNs in the run's universe.
    pub asns_total: IntGauge,
    /// Records in the accumulator after both passes.
    pub records_merged: IntGauge,
    /// Snapshot rows planned, by action (inserted/repeated/unchanged).
    pub snapshot_rows: IntCounterVec,
    /// Snapshot stage failures, by stage.
    pub snapshot_write_errors: IntCounterVec,
    /// Run timestamp as unix seconds.
    pub run_timestamp: Gauge,
    /// Wall time of the whole run.
    pub run_duration: Gauge,
}

impl PipelineMetrics {
    /// Creates a metrics instance with all metrics registered.
    ///
    /// `addr` is only used by [`PipelineMetrics::start`]; pass an empty string
    /// when no HTTP endpoint is wanted.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let batches_dispatched = IntCounterVec::new(
            Opts::new(
                "batches_dispatched_total",
                "Batches handed to a worker, by pass.",
            )
            .namespace(NAMESPACE),
            &["pass"],
        )?;
        let batch_failures = IntCounterVec::new(
            Opts::new(
                "batch_failures_total",
                "Batches whose aggregation query failed, by pass.",
            )
            .namespace(NAMESPACE),
            &["pass"],
        )?;
        let batch_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "batch_query_duration_seconds",
                "Aggregation query duration per batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["pass"],
        )?;
        let pass_duration = GaugeVec::new(
            Opts::new("pass_duration_seconds", "Wall time of the last pass.")
                .namespace(NAMESPACE),
            &["pass"],
        )?;
        let asns_total = IntGauge::with_opts(
            Opts::new("asns_total", "Non-reserved ASNs in the run's universe.")
                .namespace(NAMESPACE),
        )?;
        let records_merged = IntGauge::with_opts(
            Opts::new(
                "records_merged",
                "Records in the accumulator after both passes.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshot_rows = IntCounterVec::new(
            Opts::new("snapshot_rows_total", "Snapshot rows planned, by action.")
                .namespace(NAMESPACE),
            &["action"],
        )?;
        let snapshot_write_errors = IntCounterVec::new(
            Opts::new(
                "snapshot_write_errors_total",
                "Snapshot stage failures, by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let run_timestamp = Gauge::with_opts(
            Opts::new("run_timestamp_seconds", "Run timestamp as unix seconds.")
                .namespace(NAMESPACE),
        )?;
        let run_duration = Gauge::with_opts(
            Opts::new("run_duration_seconds", "Wall time of the whole run.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(batches_dispatched.clone()))?;
        registry.register(Box::new(batch_failures.clone()))?;
        registry.register(Box::new(batch_query_duration.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        registry.register(Box::new(asns_total.clone()))?;
        registry.register(Box::new(records_merged.clone()))?;
        registry.register(Box::new(snapshot_rows.clone()))?;
        registry.register(Box::new(snapshot_write_errors.clone()))?;
        registry.register(Box::new(run_timestamp.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            batches_dispatched,
            batch_failures,
            batch_query_duration,
            pass_duration,
            asns_total,
            records_merged,
            snapshot_rows,
            snapshot_write_errors,
            run_timestamp,
            run_duration,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Writes the metrics as a node-exporter textfile.
    ///
    /// The file is written next to `path` and renamed into place so the
    /// collector never reads a partial file.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.render()?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = Path::new(&tmp);

        std::fs::write(tmp, text)
            .with_context(|| format!("writing metrics textfile {}", tmp.display()))?;
        std::fs::rename(tmp, path)
            .with_context(|| format!("renaming metrics textfile to {}", path.display()))?;

        Ok(())
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
