use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::analysis::{Report, Stats};
use crate::assembly::DemuxStatsSnapshot;

const NAMESPACE: &str = "memsniff";

/// Prometheus metrics for pipeline health.
///
/// The pipeline keeps its own atomic counters; [`HealthMetrics::observe`]
/// folds their growth into the exported counters.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    last: parking_lot::Mutex<Observed>,

    /// Events accepted by the analysis shards.
    pub events_handled: IntCounter,
    /// Events dropped because a shard mailbox was full.
    pub events_dropped: IntCounter,
    /// Deliveries accepted by the demultiplexer.
    pub deliveries_handled: IntCounter,
    /// Deliveries dropped because a worker mailbox was full.
    pub deliveries_dropped: IntCounter,
    /// Conversations started.
    pub conversations_started: IntCounter,
    /// Keys in the most recent report.
    pub report_keys: IntGauge,
    /// Bytes served across all keys in the most recent report.
    pub report_traffic_bytes: IntGauge,
    /// Time spent collecting a report from all shards.
    pub report_duration: Histogram,
}

/// Last counter values folded into the exported metrics.
#[derive(Debug, Default, Clone, Copy)]
struct Observed {
    analysis: Stats,
    demux: DemuxStatsSnapshot,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn gauge(name: &str, help: &str) -> prometheus::Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_handled = counter(
            "events_handled_total",
            "Total events accepted by the analysis shards.",
        )?;
        let events_dropped = counter(
            "events_dropped_total",
            "Total events dropped because an analysis shard was full.",
        )?;
        let deliveries_handled = counter(
            "deliveries_handled_total",
            "Total reassembled deliveries accepted by the demultiplexer.",
        )?;
        let deliveries_dropped = counter(
            "deliveries_dropped_total",
            "Total deliveries dropped because a demultiplexer worker was full.",
        )?;
        let conversations_started = counter(
            "conversations_started_total",
            "Total client/server conversations started.",
        )?;
        let report_keys = gauge("report_keys", "Number of keys in the most recent report.")?;
        let report_traffic_bytes = gauge(
            "report_traffic_bytes",
            "Bytes served across all keys in the most recent report.",
        )?;
        let report_duration = Histogram::with_opts(
            HistogramOpts::new(
                "report_duration_seconds",
                "Time spent collecting a report from all shards.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(events_handled.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(deliveries_handled.clone()))?;
        registry.register(Box::new(deliveries_dropped.clone()))?;
        registry.register(Box::new(conversations_started.clone()))?;
        registry.register(Box::new(report_keys.clone()))?;
        registry.register(Box::new(report_traffic_bytes.clone()))?;
        registry.register(Box::new(report_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            last: parking_lot::Mutex::new(Observed::default()),
            events_handled,
            events_dropped,
            deliveries_handled,
            deliveries_dropped,
            conversations_started,
            report_keys,
            report_traffic_bytes,
            report_duration,
        })
    }

    /// Adds counter growth since the previous call.
    pub fn observe(&self, analysis: Stats, demux: DemuxStatsSnapshot) {
        let mut last = self.last.lock();

        self.events_handled
            .inc_by(analysis.events_handled.saturating_sub(last.analysis.events_handled));
        self.events_dropped
            .inc_by(analysis.events_dropped.saturating_sub(last.analysis.events_dropped));
        self.deliveries_handled
            .inc_by(demux.deliveries_handled.saturating_sub(last.demux.deliveries_handled));
        self.deliveries_dropped
            .inc_by(demux.deliveries_dropped.saturating_sub(last.demux.deliveries_dropped));
        self.conversations_started.inc_by(
            demux
                .conversations_started
                .saturating_sub(last.demux.conversations_started),
        );

        *last = Observed { analysis, demux };
    }

    /// Records the size of a freshly collected report.
    pub fn observe_report(&self, report: &Report) {
        self.report_keys
            .set(i64::try_from(report.keys.len()).unwrap_or(i64::MAX));
        self.report_traffic_bytes
            .set(i64::try_from(report.total_traffic()).unwrap_or(i64::MAX));
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
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
        });

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

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::time::SystemTime;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::analysis::KeyReport;

    #[test]
    fn test_observe_adds_growth() {
        let metrics = HealthMetrics::new(":0").unwrap();

        metrics.observe(
            Stats {
                events_handled: 10,
                events_dropped: 2,
            },
            DemuxStatsSnapshot {
                deliveries_handled: 5,
                deliveries_dropped: 0,
                conversations_started: 1,
            },
        );
        metrics.observe(
            Stats {
                events_handled: 15,
                events_dropped: 2,
            },
            DemuxStatsSnapshot {
                deliveries_handled: 9,
                deliveries_dropped: 3,
                conversations_started: 1,
            },
        );

        assert_eq!(metrics.events_handled.get(), 15);
        assert_eq!(metrics.events_dropped.get(), 2);
        assert_eq!(metrics.deliveries_handled.get(), 9);
        assert_eq!(metrics.deliveries_dropped.get(), 3);
        assert_eq!(metrics.conversations_started.get(), 1);
    }

    #[test]
    fn test_render_uses_namespace() {
        let metrics = HealthMetrics::new(":0").unwrap();
        metrics.observe_report(&Report::new(
            SystemTime::now(),
            vec![KeyReport::first_hit("a", 7), KeyReport::first_hit("b", 3)],
        ));

        let text = metrics.render().unwrap();
        assert!(text.contains("memsniff_events_handled_total 0"));
        assert!(text.contains("memsniff_report_keys 2"));
        assert!(text.contains("memsniff_report_traffic_bytes 10"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        let addr = metrics.start().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.ends_with("ok"));

        metrics.stop();
    }
}
