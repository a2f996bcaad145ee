//! Observability for a quorus node.
//!
//! One process-wide prometheus registry carries everything a node exports:
//! object operations, replication and repair activity, peer RPC traffic,
//! queue publishes, compaction and admission pressure. Metrics register
//! themselves at construction, so a name can never exist unregistered.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::LazyLock;

/// Install the process-wide tracing subscriber. Filtering follows
/// `RUST_LOG`; without one, info and above is emitted.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

static METRICS: LazyLock<NodeMetrics> = LazyLock::new(NodeMetrics::new);

/// The process-wide metrics instance.
pub fn metrics() -> &'static NodeMetrics {
    &METRICS
}

/// Every metric a quorus node exports.
pub struct NodeMetrics {
    pub registry: Registry,

    // Object operations.
    pub object_gets: IntCounter,
    pub object_puts: IntCounter,
    pub object_deletes: IntCounter,
    pub object_heads: IntCounter,
    pub op_latency_secs: HistogramVec,

    // Replication and repair.
    pub replications: IntCounterVec,
    pub quorum_failures: IntCounter,
    pub read_repairs: IntCounter,
    pub repair_failures: IntCounter,

    // Peer RPC traffic.
    pub rpcs_sent: IntCounter,
    pub rpcs_received: IntCounter,
    pub rpcs_sent_by_type: IntCounterVec,
    pub rpcs_received_by_type: IntCounterVec,
    pub rpc_latency_secs: HistogramVec,

    // Queues, compaction, admission.
    pub queue_publishes: IntCounterVec,
    pub compaction_runs: IntCounter,
    pub watchdog_alarms: IntCounterVec,
    pub pool_rejections: IntCounter,
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        Self {
            object_gets: counter(&registry, "quorus_object_gets_total", "GET operations"),
            object_puts: counter(&registry, "quorus_object_puts_total", "PUT operations"),
            object_deletes: counter(&registry, "quorus_object_deletes_total", "DELETE operations"),
            object_heads: counter(&registry, "quorus_object_heads_total", "HEAD operations"),
            op_latency_secs: histogram_vec(
                &registry,
                "quorus_op_latency_seconds",
                "Object operation latency in seconds",
                &["op_type"],
            ),
            replications: counter_vec(
                &registry,
                "quorus_replications_total",
                "Replica fan-outs, by method and outcome",
                &["method", "outcome"],
            ),
            quorum_failures: counter(
                &registry,
                "quorus_quorum_failures_total",
                "Operations failed below quorum",
            ),
            read_repairs: counter(
                &registry,
                "quorus_read_repairs_total",
                "Read repair passes triggered",
            ),
            repair_failures: counter(
                &registry,
                "quorus_repair_failures_total",
                "Read repair passes that could not converge",
            ),
            rpcs_sent: counter(
                &registry,
                "quorus_rpcs_sent_total",
                "Total outbound peer RPCs sent",
            ),
            rpcs_received: counter(
                &registry,
                "quorus_rpcs_received_total",
                "Total inbound peer RPCs received",
            ),
            rpcs_sent_by_type: counter_vec(
                &registry,
                "quorus_rpcs_sent_by_type_total",
                "Outbound peer RPCs sent, by type",
                &["rpc_type"],
            ),
            rpcs_received_by_type: counter_vec(
                &registry,
                "quorus_rpcs_received_by_type_total",
                "Inbound peer RPCs received, by type",
                &["rpc_type"],
            ),
            rpc_latency_secs: histogram_vec(
                &registry,
                "quorus_rpc_latency_seconds",
                "Peer RPC latency in seconds",
                &["rpc_type", "direction"],
            ),
            queue_publishes: counter_vec(
                &registry,
                "quorus_queue_publishes_total",
                "Messages published, by topic",
                &["topic"],
            ),
            compaction_runs: counter(
                &registry,
                "quorus_compaction_runs_total",
                "Auto-compaction runs started",
            ),
            watchdog_alarms: counter_vec(
                &registry,
                "quorus_watchdog_alarms_total",
                "Watchdog alarms handled, by channel",
                &["channel"],
            ),
            pool_rejections: counter(
                &registry,
                "quorus_pool_rejections_total",
                "Tasks rejected by worker-pool admission",
            ),
            registry,
        }
    }
}

// Construct-and-register helpers. Registration failure means a duplicate
// metric name, which is a programming error worth dying for.

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("counter opts");
    registry
        .register(Box::new(counter.clone()))
        .expect("duplicate metric name");
    counter
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let family = IntCounterVec::new(Opts::new(name, help), labels).expect("counter family opts");
    registry
        .register(Box::new(family.clone()))
        .expect("duplicate metric name");
    family
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    // 0.5 ms up to ~32 s, one bucket per 4x step.
    let buckets = prometheus::exponential_buckets(0.0005, 4.0, 9).expect("bucket layout");
    let family = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram family opts");
    registry
        .register(Box::new(family.clone()))
        .expect("duplicate metric name");
    family
}

/// Latency guard for one object operation; records elapsed time on drop.
pub fn start_op_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .op_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

/// Latency guard for one peer RPC.
pub fn start_rpc_timer(rpc_type: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[rpc_type, direction])
        .start_timer()
}

/// Render every registered metric in the text exposition format.
pub fn encode_metrics() -> String {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&metrics().registry.gather(), &mut buf)
        .expect("encode gathered metrics");
    String::from_utf8(buf).expect("exposition text is utf-8")
}

// ---------------------------------------------------------------------------
// Scrape endpoint
// ---------------------------------------------------------------------------

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

/// Answer Prometheus scrapes on `addr` (any path; scrapers use
/// `/metrics`). Runs until the listener fails; spawn it next to the gRPC
/// server.
pub async fn serve_metrics(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics exposed at http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let scrape = service_fn(|_req: Request<hyper::body::Incoming>| async {
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", TextEncoder::new().format_type())
                    .body(Full::new(Bytes::from(encode_metrics())))
                    .expect("static response parts");
                Ok::<_, std::convert::Infallible>(response)
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), scrape)
                .await
            {
                tracing::debug!("metrics scrape connection ended: {}", e);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
