//! Watchdog subscription and the adaptive controller.
//!
//! Two channels feed the controller: resource alarms (CPU, disk, cluster,
//! message count) throttle the compactor and every queue consumer, and
//! fragmentation alarms trigger opportunistic compaction when the cluster
//! can afford it. The registry doubles as the pre-flight guard consulted
//! before every local operation.

use crate::peer::PeerClient;
use quorus_common::wall_clock_secs;
use quorus_mq::QueueThrottle;
use quorus_ring::RedundancyResolver;
use quorus_store::{CompactionStatus, ObjectStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Alarm severities. Fragmentation acts only at `LEVEL_ERROR` and above.
pub const LEVEL_WARN: u8 = 2;
pub const LEVEL_ERROR: u8 = 3;

/// The resource classes watchdogs monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogKind {
    Cpu,
    Disk,
    Cluster,
    MsgCount,
    Fragmentation,
}

/// An alarm event with its severity and free-form properties.
#[derive(Debug, Clone)]
pub struct WatchdogAlarm {
    pub kind: WatchdogKind,
    pub level: u8,
    pub props: HashMap<String, String>,
}

impl WatchdogAlarm {
    pub fn error(kind: WatchdogKind) -> Self {
        Self {
            kind,
            level: LEVEL_ERROR,
            props: HashMap::new(),
        }
    }
}

/// Events on the resource channel.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Alarm(WatchdogAlarm),
    /// The watchdog observed enough consecutive safe readings.
    SafeCountReached(WatchdogKind),
}

// ---------------------------------------------------------------------------
// Watchdog state (pre-flight guard)
// ---------------------------------------------------------------------------

/// Query surface for the pre-flight guard.
pub trait WatchdogState: Send + Sync + 'static {
    /// The currently-unsafe watchdogs, minus the excluded ones.
    fn find_not_safe_items(&self, exclude: &[WatchdogKind]) -> Vec<WatchdogKind>;
}

/// Registry of unsafe watchdogs, kept current by the subscriber.
#[derive(Debug, Default)]
pub struct WatchdogRegistry {
    unsafe_items: Mutex<HashSet<WatchdogKind>>,
}

impl WatchdogRegistry {
    pub fn set_unsafe(&self, kind: WatchdogKind) {
        self.unsafe_items
            .lock()
            .expect("watchdog lock poisoned")
            .insert(kind);
    }

    pub fn set_safe(&self, kind: WatchdogKind) {
        self.unsafe_items
            .lock()
            .expect("watchdog lock poisoned")
            .remove(&kind);
    }
}

impl WatchdogState for WatchdogRegistry {
    fn find_not_safe_items(&self, exclude: &[WatchdogKind]) -> Vec<WatchdogKind> {
        self.unsafe_items
            .lock()
            .expect("watchdog lock poisoned")
            .iter()
            .filter(|k| !exclude.contains(k))
            .copied()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Compactor concurrency handle
// ---------------------------------------------------------------------------

/// Concurrency knob of the store's compactor FSM.
#[derive(Debug, Clone)]
pub struct CompactorControl {
    parallelism: Arc<AtomicUsize>,
    max: usize,
}

impl CompactorControl {
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            parallelism: Arc::new(AtomicUsize::new(initial.clamp(1, max.max(1)))),
            max: max.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::Relaxed)
    }

    pub fn increase(&self) {
        let prev = self.parallelism.load(Ordering::Relaxed);
        if prev < self.max {
            self.parallelism.store(prev + 1, Ordering::Relaxed);
        }
    }

    pub fn decrease(&self) {
        let prev = self.parallelism.load(Ordering::Relaxed);
        if prev > 1 {
            self.parallelism.store(prev - 1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Adaptive controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub wd_cpu_enabled: bool,
    pub wd_disk_enabled: bool,
    pub auto_compaction_interval: Duration,
    pub compaction_pre_wait: Duration,
    pub request_timeout: Duration,
}

/// Subscribes to the watchdog channels and adapts compactor and queue
/// concurrency to the node's condition.
pub struct AdaptiveController<S: ObjectStore, P: PeerClient> {
    store: Arc<S>,
    peers: Arc<P>,
    resolver: Arc<dyn RedundancyResolver>,
    registry: Arc<WatchdogRegistry>,
    compactor: CompactorControl,
    throttles: Vec<QueueThrottle>,
    cfg: ControllerConfig,
}

impl<S: ObjectStore, P: PeerClient> AdaptiveController<S, P> {
    pub fn new(
        store: Arc<S>,
        peers: Arc<P>,
        resolver: Arc<dyn RedundancyResolver>,
        registry: Arc<WatchdogRegistry>,
        compactor: CompactorControl,
        throttles: Vec<QueueThrottle>,
        cfg: ControllerConfig,
    ) -> Self {
        Self {
            store,
            peers,
            resolver,
            registry,
            compactor,
            throttles,
            cfg,
        }
    }

    /// Spawn the two subscriber loops. Each runs until its channel closes.
    pub fn spawn(
        self: Arc<Self>,
        mut resource_rx: mpsc::Receiver<ResourceEvent>,
        mut frag_rx: mpsc::Receiver<WatchdogAlarm>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let resource_controller = self.clone();
        let resource_task = tokio::spawn(async move {
            while let Some(event) = resource_rx.recv().await {
                resource_controller.on_resource_event(event);
            }
            tracing::debug!("resource watchdog channel closed");
        });

        let frag_task = tokio::spawn(async move {
            while let Some(alarm) = frag_rx.recv().await {
                self.on_fragmentation_alarm(alarm).await;
            }
            tracing::debug!("fragmentation watchdog channel closed");
        });

        (resource_task, frag_task)
    }

    /// Channel A: resource alarms raise or lower compactor and queue
    /// concurrency — but only while the CPU or disk watchdog is enabled.
    pub fn on_resource_event(&self, event: ResourceEvent) {
        quorus_metrics::metrics()
            .watchdog_alarms
            .with_label_values(&["resource"])
            .inc();
        let throttling_enabled = self.cfg.wd_cpu_enabled || self.cfg.wd_disk_enabled;

        match event {
            ResourceEvent::Alarm(alarm) => {
                tracing::info!("watchdog alarm: {:?} level {}", alarm.kind, alarm.level);
                self.registry.set_unsafe(alarm.kind);
                if throttling_enabled {
                    self.compactor.decrease();
                    for throttle in &self.throttles {
                        throttle.decrease();
                    }
                }
            }
            ResourceEvent::SafeCountReached(kind) => {
                tracing::info!("watchdog safe again: {:?}", kind);
                self.registry.set_safe(kind);
                if throttling_enabled {
                    self.compactor.increase();
                    for throttle in &self.throttles {
                        throttle.increase();
                    }
                }
            }
        }
    }

    /// Channel B: a fragmentation alarm at ERROR triggers opportunistic
    /// compaction when the cluster can afford it and the compactor is
    /// idle with pending targets past the configured interval.
    pub async fn on_fragmentation_alarm(&self, alarm: WatchdogAlarm) {
        quorus_metrics::metrics()
            .watchdog_alarms
            .with_label_values(&["fragmentation"])
            .inc();
        if alarm.level < LEVEL_ERROR {
            return;
        }
        if !self.can_start_compaction().await {
            tracing::debug!("cluster busy, deferring compaction");
            return;
        }

        // Settle window between the gate check and the state read.
        tokio::time::sleep(self.cfg.compaction_pre_wait).await;

        let stats = self.store.compaction_stats();
        let elapsed = wall_clock_secs().saturating_sub(stats.latest_exec_time);
        if stats.status != CompactionStatus::Idle
            || stats.pending_targets.is_empty()
            || elapsed < self.cfg.auto_compaction_interval.as_secs()
        {
            return;
        }

        quorus_metrics::metrics().compaction_runs.inc();
        let local = self.resolver.local_node();
        let resolver = self.resolver.clone();
        let owned = move |key: &str| resolver.has_charge_of_node(key, &local);
        if let Err(e) =
            self.store
                .compact_data(&stats.pending_targets, self.compactor.parallelism(), &owned)
        {
            tracing::warn!("auto-compaction failed: {}", e);
        }
    }

    /// Whether this node may start compacting: fewer than
    /// `max(1, round(members / N) − 1)` members are already running a
    /// compaction. A missing replication factor refuses outright.
    pub async fn can_start_compaction(&self) -> bool {
        let params = match self.resolver.replication_params() {
            Some(params) => params,
            None => return false,
        };
        let members = self.resolver.running_members();
        let allowable = std::cmp::max(
            1,
            (members.len() as f64 / params.n as f64).round() as i64 - 1,
        ) as usize;

        let local = self.resolver.local_node();
        let mut running = 0usize;
        for member in &members {
            let status = if member.id == local {
                Some(self.store.compaction_stats())
            } else {
                match tokio::time::timeout(
                    self.cfg.request_timeout,
                    self.peers.compact_status(member.addr),
                )
                .await
                {
                    Ok(Ok(stats)) => Some(stats),
                    Ok(Err(e)) => {
                        tracing::debug!("compact status from {} failed: {}", member.addr, e);
                        None
                    }
                    Err(_) => None,
                }
            };
            if let Some(stats) = status {
                if stats.status == CompactionStatus::Running {
                    running += 1;
                    if running >= allowable {
                        return false;
                    }
                }
            }
        }
        running < allowable
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
