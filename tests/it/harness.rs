use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use olt_poller::config::Config;
use olt_poller::dispatch::Dispatcher;
use olt_poller::event::{EventHub, EventWriter};
use olt_poller::flag::ShutdownFlag;
use olt_poller::model::{Device, ExecutionStatus, Node, ProbeKind};
use olt_poller::pool::{PollerPool, PoolStats};
use olt_poller::probe::{ProbeExecutor, ProbeReport};
use olt_poller::scheduler::{Scheduler, TickHealth};
use olt_poller::store::memory::{MemoryEventSink, MemoryStore};
use olt_poller::watchdog::Watchdog;
use parking_lot::Mutex;

/// One scripted probe outcome.
#[derive(Clone, Copy, Debug)]
pub struct Script {
    pub status: ExecutionStatus,
    pub delay: Duration,
}

/// A probe engine double driven by per-node scripts.
///
/// Also instruments the invariants the pool must uphold: global concurrency
/// and per-device exclusivity.
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<i64, Vec<Script>>>,
    default: Script,
    active_global: AtomicUsize,
    max_global: AtomicUsize,
    active_per_device: Mutex<HashMap<i64, usize>>,
    device_overlap: AtomicBool,
    runs: Mutex<Vec<i64>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: Script {
                status: ExecutionStatus::Success,
                delay: Duration::from_millis(10),
            },
            active_global: AtomicUsize::new(0),
            max_global: AtomicUsize::new(0),
            active_per_device: Mutex::new(HashMap::new()),
            device_overlap: AtomicBool::new(false),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Queue an outcome for the node's next run. Unscripted runs succeed
    /// after a short delay.
    pub fn script(&self, node_id: i64, status: ExecutionStatus, delay: Duration) {
        self.scripts
            .lock()
            .entry(node_id)
            .or_default()
            .push(Script { status, delay });
    }

    /// Node ids in the order their probes started.
    pub fn runs(&self) -> Vec<i64> {
        self.runs.lock().clone()
    }

    pub fn run_count(&self, node_id: i64) -> usize {
        self.runs.lock().iter().filter(|id| **id == node_id).count()
    }

    /// Highest number of probes observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_global.load(Ordering::SeqCst)
    }

    /// True if two probes ever overlapped on the same device.
    pub fn device_overlap(&self) -> bool {
        self.device_overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeExecutor for ScriptedExecutor {
    async fn execute(&self, device: &Device, node: &Node) -> ProbeReport {
        let script = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&node.id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => self.default,
            }
        };

        self.runs.lock().push(node.id);

        let active = self.active_global.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_global.fetch_max(active, Ordering::SeqCst);
        {
            let mut per_device = self.active_per_device.lock();
            let count = per_device.entry(device.id).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.device_overlap.store(true, Ordering::SeqCst);
            }
        }

        tokio::time::sleep(script.delay).await;

        {
            let mut per_device = self.active_per_device.lock();
            if let Some(count) = per_device.get_mut(&device.id) {
                *count -= 1;
            }
        }
        self.active_global.fetch_sub(1, Ordering::SeqCst);

        ProbeReport {
            status: script.status,
            summary: serde_json::json!({ "node": node.id }),
            duration: script.delay,
        }
    }
}

/// Fully wired coordinator over the in-memory stores.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemoryEventSink>,
    pub executor: Arc<ScriptedExecutor>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Scheduler,
    pub watchdog: Watchdog,
    pub health: TickHealth,
    pub shutdown: ShutdownFlag,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new(config.queue_soft_limit));
        let sink = Arc::new(MemoryEventSink::new());
        let executor = Arc::new(ScriptedExecutor::new());
        let shutdown = ShutdownFlag::new();

        let (hub, rx) = EventHub::new(config.event_buffer);
        tokio::spawn(EventWriter::new(rx, sink.clone()).run());

        let pool = PollerPool::new(
            config.clone(),
            store.clone(),
            store.clone(),
            executor.clone(),
            hub.clone(),
            shutdown.clone(),
            "test-coordinator".into(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            pool,
            hub.clone(),
        ));

        let health = TickHealth::new();
        let scheduler = Scheduler::new(
            config.clone(),
            store.clone(),
            dispatcher.clone(),
            hub.clone(),
            shutdown.clone(),
            health.clone(),
        );
        let watchdog = Watchdog::new(
            config,
            store.clone(),
            dispatcher.clone(),
            hub,
            shutdown.clone(),
        );

        Self {
            store,
            sink,
            executor,
            dispatcher,
            scheduler,
            watchdog,
            health,
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_config())
    }

    pub async fn stats(&self) -> PoolStats {
        self.dispatcher.pool().stats().await
    }

    /// Block until every execution row is in a final state.
    pub async fn wait_idle(&self) {
        let store = self.store.clone();
        wait_until(Duration::from_secs(5), move || {
            store.executions().iter().all(|row| row.status.is_final())
        })
        .await;
    }

    pub async fn wait_for_event(&self, kind: &'static str) {
        let sink = self.sink.clone();
        wait_until(Duration::from_secs(5), move || {
            sink.kinds().contains(&kind)
        })
        .await;
    }
}

pub fn test_config() -> Config {
    Config {
        pool_size: 2,
        shutdown_grace: Duration::from_secs(2),
        ..Config::default()
    }
}

pub fn device(id: i64) -> Device {
    Device {
        id,
        label: format!("olt-{id}"),
        address: format!("10.10.0.{id}:161"),
        credential: "lab".into(),
        enabled: true,
        vendor: Some("zte".into()),
    }
}

/// A master ready `next_in_secs` seconds from now (negative means overdue).
pub fn master(id: i64, device_id: i64, priority: i32, interval_secs: i64, next_in_secs: i64) -> Node {
    Node {
        id,
        device_id,
        name: format!("probe-{id}"),
        kind: ProbeKind::Discovery,
        priority,
        interval_secs,
        enabled: true,
        next_run_at: Some(Utc::now() + chrono::Duration::seconds(next_in_secs)),
        last_run_at: None,
        last_success_at: None,
        last_failure_at: None,
        chain_master_id: None,
        chain_order: 0,
        fire_after: None,
        gate_closed: false,
    }
}

pub fn follower(id: i64, device_id: i64, master_id: i64, order: i32) -> Node {
    Node {
        id,
        device_id,
        name: format!("probe-{id}"),
        kind: ProbeKind::Get,
        priority: ProbeKind::Get.default_priority(),
        interval_secs: 60,
        enabled: true,
        next_run_at: None,
        last_run_at: None,
        last_success_at: None,
        last_failure_at: None,
        chain_master_id: Some(master_id),
        chain_order: order,
        fire_after: None,
        gate_closed: false,
    }
}

/// Poll `condition` until it holds or the timeout expires.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
