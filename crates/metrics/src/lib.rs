//! Metrics and tracing setup for needlestore.
//!
//! Provides a global [`StoreMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<StoreMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static StoreMetrics {
    METRICS.get_or_init(StoreMetrics::new)
}

/// All Prometheus metrics for a needlestore node.
pub struct StoreMetrics {
    pub registry: Registry,

    // ── Store operation counters ──
    pub writes_total: IntCounter,
    pub reads_total: IntCounter,
    pub deletes_total: IntCounter,

    // ── Byte counters ──
    pub bytes_written_total: IntCounter,
    pub bytes_read_total: IntCounter,

    // ── Volume lifecycle ──
    pub volumes_created: IntCounter,
    pub compactions_total: IntCounter,
    pub compaction_reclaimed_bytes: IntCounter,

    // ── Operation latency ──
    pub op_latency_secs: HistogramVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for store operation latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl StoreMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let writes_total = IntCounter::with_opts(Opts::new(
            "needlestore_writes_total",
            "Total successful write operations",
        ))
        .expect("writes_total counter");
        let reads_total = IntCounter::with_opts(Opts::new(
            "needlestore_reads_total",
            "Total successful read operations",
        ))
        .expect("reads_total counter");
        let deletes_total = IntCounter::with_opts(Opts::new(
            "needlestore_deletes_total",
            "Total successful delete operations",
        ))
        .expect("deletes_total counter");

        let bytes_written_total = IntCounter::with_opts(Opts::new(
            "needlestore_bytes_written_total",
            "Payload bytes written to volumes",
        ))
        .expect("bytes_written_total counter");
        let bytes_read_total = IntCounter::with_opts(Opts::new(
            "needlestore_bytes_read_total",
            "Payload bytes served from volumes",
        ))
        .expect("bytes_read_total counter");

        let volumes_created = IntCounter::with_opts(Opts::new(
            "needlestore_volumes_created_total",
            "Volumes created, at startup or by rollover",
        ))
        .expect("volumes_created counter");
        let compactions_total = IntCounter::with_opts(Opts::new(
            "needlestore_compactions_total",
            "Volume rewrites completed by the compactor",
        ))
        .expect("compactions_total counter");
        let compaction_reclaimed_bytes = IntCounter::with_opts(Opts::new(
            "needlestore_compaction_reclaimed_bytes_total",
            "Bytes reclaimed by compaction",
        ))
        .expect("compaction_reclaimed_bytes counter");

        let op_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "needlestore_op_latency_seconds",
                "Store operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )
        .expect("op_latency_secs histogram");

        // Register all metrics
        registry
            .register(Box::new(writes_total.clone()))
            .expect("register writes_total");
        registry
            .register(Box::new(reads_total.clone()))
            .expect("register reads_total");
        registry
            .register(Box::new(deletes_total.clone()))
            .expect("register deletes_total");
        registry
            .register(Box::new(bytes_written_total.clone()))
            .expect("register bytes_written_total");
        registry
            .register(Box::new(bytes_read_total.clone()))
            .expect("register bytes_read_total");
        registry
            .register(Box::new(volumes_created.clone()))
            .expect("register volumes_created");
        registry
            .register(Box::new(compactions_total.clone()))
            .expect("register compactions_total");
        registry
            .register(Box::new(compaction_reclaimed_bytes.clone()))
            .expect("register compaction_reclaimed_bytes");
        registry
            .register(Box::new(op_latency_secs.clone()))
            .expect("register op_latency_secs");

        Self {
            registry,
            writes_total,
            reads_total,
            deletes_total,
            bytes_written_total,
            bytes_read_total,
            volumes_created,
            compactions_total,
            compaction_reclaimed_bytes,
            op_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start an operation latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_op_timer(op: &str) -> prometheus::HistogramTimer {
    metrics()
        .op_latency_secs
        .with_label_values(&[op])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
