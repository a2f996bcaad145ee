//! quorus-node: entry point for a storage node.
//!
//! Loads config, seeds the ring from the configured membership, wires the
//! store, queue, handler and adaptive controller, then serves the peer
//! and admin gRPC services on the configured listen address.

use quorus_engine::notify::QueueNotifier;
use quorus_engine::watchdog::{
    AdaptiveController, CompactorControl, ControllerConfig, WatchdogRegistry,
};
use quorus_engine::{ObjectHandler, WorkerPool};
use quorus_mq::{LocalQueue, MessageQueue};
use quorus_net::{build_server, GrpcPeerClient};
use quorus_ring::{NodeMember, RedundancyResolver, ReplicationParams, RingResolver};
use quorus_store::MemStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    quorus_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config =
        quorus_config::load_from_file(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            quorus_config::load_from_str("listen: \"127.0.0.1:7100\"\nmembers: []\n")
                .expect("hardcoded default config must parse")
        });

    // Seed the ring: this node plus every configured member.
    let local_member = NodeMember::running(config.listen);
    let resolver = Arc::new(RingResolver::new(
        local_member.id,
        ReplicationParams {
            n: config.replication.n,
            w: config.replication.w,
            r: config.replication.r,
            d: config.replication.d,
        },
        config.vnodes,
    ));
    resolver.add_member(local_member);
    for member in &config.members {
        match member.parse() {
            Ok(addr) if addr != config.listen => {
                resolver.add_member(NodeMember::running(addr));
            }
            Ok(_) => {} // the local node is already on the ring
            Err(e) => tracing::warn!("skipping malformed member '{}': {}", member, e),
        }
    }
    tracing::info!(
        "node {} listening on {}, {} member(s) on the ring",
        resolver.local_node(),
        config.listen,
        resolver.running_members().len()
    );

    let store = Arc::new(MemStore::new(config.containers));
    let queue = Arc::new(LocalQueue::default());
    let peers = Arc::new(GrpcPeerClient::new(config.request_timeout()));
    let registry = Arc::new(WatchdogRegistry::default());
    let notifier = Arc::new(QueueNotifier::new(queue.clone() as Arc<dyn MessageQueue>));

    let handler = Arc::new(ObjectHandler::new(
        resolver.clone(),
        store.clone(),
        peers.clone(),
        queue.clone(),
        notifier,
        registry.clone(),
        config.request_timeout(),
    ));

    let pool = Arc::new(WorkerPool::new(
        "replica",
        8,
        config.worker_pool_pending_limit,
    ));

    // Adaptive controller: compactor and queue throttles under watchdog
    // control. The senders are the surface watchdog processes publish to.
    let compactor = CompactorControl::new(
        config.auto_compaction_parallel_procs,
        config.auto_compaction_parallel_procs.max(8),
    );
    let controller = Arc::new(AdaptiveController::new(
        store.clone(),
        peers.clone(),
        resolver.clone(),
        registry,
        compactor,
        queue.throttles(),
        ControllerConfig {
            wd_cpu_enabled: config.wd_cpu_enabled,
            wd_disk_enabled: config.wd_disk_enabled,
            auto_compaction_interval: Duration::from_secs(config.auto_compaction_interval),
            compaction_pre_wait: config.compaction_pre_wait(),
            request_timeout: config.request_timeout(),
        },
    ));
    let (_resource_alarms, resource_rx) = mpsc::channel(64);
    let (_fragmentation_alarms, frag_rx) = mpsc::channel(64);
    controller.spawn(resource_rx, frag_rx);

    // Metrics HTTP server, if configured.
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: std::net::SocketAddr = format!("0.0.0.0:{}", metrics_port)
            .parse()
            .expect("valid metrics address");
        tokio::spawn(async move {
            if let Err(e) = quorus_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let node_id = format!("{}", resolver.local_node());
    let router = build_server(handler, pool, store, node_id);

    // Serve with graceful shutdown on Ctrl+C.
    tracing::info!("serving gRPC on {}", config.listen);
    tokio::select! {
        result = router.serve(config.listen) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
