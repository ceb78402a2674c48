use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

use crate::model::ExecutionStatus;

/// One scheduling decision, as recorded in the append-only event log.
///
/// Every decision the coordinator takes emits exactly one of these. The log
/// powers the live dashboard and post-mortem debugging; entries are never
/// mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    TickStart {
        at: DateTime<Utc>,
        ready: usize,
    },
    /// A master without a `next_run_at` was auto-repaired at tick start.
    NextRunInitialized {
        master_id: i64,
        next_run_at: DateTime<Utc>,
    },
    DispatchDecision {
        device_id: i64,
        master_id: i64,
        outcome: String,
    },
    DuplicateSuppressed {
        device_id: i64,
        master_id: i64,
    },
    TooSoon {
        device_id: i64,
        master_id: i64,
    },
    Queued {
        device_id: i64,
        master_id: i64,
        /// True when the entry was queued because the pool was full rather
        /// than because the device was busy.
        pool_full: bool,
    },
    SlotFreed {
        slot: usize,
        device_id: i64,
    },
    TaskStarted {
        device_id: i64,
        master_id: i64,
        execution_id: i64,
        slot: usize,
    },
    TaskCompleted {
        device_id: i64,
        master_id: i64,
        execution_id: i64,
        status: ExecutionStatus,
        duration_ms: u64,
    },
    Overload {
        device_id: i64,
        master_id: i64,
        size: u64,
    },
    OrphanRecovered {
        device_id: i64,
        master_id: i64,
        execution_id: i64,
    },
    Shutdown {
        finished: u64,
        interrupted: u64,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TickStart { .. } => "TICK_START",
            Event::NextRunInitialized { .. } => "NEXT_RUN_INITIALIZED",
            Event::DispatchDecision { .. } => "DISPATCH_DECISION",
            Event::DuplicateSuppressed { .. } => "DUPLICATE_SUPPRESSED",
            Event::TooSoon { .. } => "TOO_SOON",
            Event::Queued { .. } => "QUEUED",
            Event::SlotFreed { .. } => "SLOT_FREED",
            Event::TaskStarted { .. } => "TASK_STARTED",
            Event::TaskCompleted { .. } => "TASK_COMPLETED",
            Event::Overload { .. } => "OVERLOAD",
            Event::OrphanRecovered { .. } => "ORPHAN_RECOVERED",
            Event::Shutdown { .. } => "SHUTDOWN",
        }
    }

    pub fn device_id(&self) -> Option<i64> {
        match self {
            Event::DispatchDecision { device_id, .. }
            | Event::DuplicateSuppressed { device_id, .. }
            | Event::TooSoon { device_id, .. }
            | Event::Queued { device_id, .. }
            | Event::SlotFreed { device_id, .. }
            | Event::TaskStarted { device_id, .. }
            | Event::TaskCompleted { device_id, .. }
            | Event::Overload { device_id, .. }
            | Event::OrphanRecovered { device_id, .. } => Some(*device_id),
            _ => None,
        }
    }

    pub fn master_id(&self) -> Option<i64> {
        match self {
            Event::NextRunInitialized { master_id, .. }
            | Event::DispatchDecision { master_id, .. }
            | Event::DuplicateSuppressed { master_id, .. }
            | Event::TooSoon { master_id, .. }
            | Event::Queued { master_id, .. }
            | Event::TaskStarted { master_id, .. }
            | Event::TaskCompleted { master_id, .. }
            | Event::Overload { master_id, .. }
            | Event::OrphanRecovered { master_id, .. } => Some(*master_id),
            _ => None,
        }
    }
}

/// An event as it lands in the durable log, with the index columns pulled
/// out of the payload.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub at: DateTime<Utc>,
    pub kind: &'static str,
    pub device_id: Option<i64>,
    pub master_id: Option<i64>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, batch: &[StoredEvent]) -> anyhow::Result<()>;

    /// Delete events older than the horizon. Sinks without retention
    /// enforcement may ignore this.
    async fn prune(&self, _older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(0)
    }
}

/// Discards every event. The default sink when no durable log is wired up;
/// events still reach the tracing output through the hub.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn append(&self, _batch: &[StoredEvent]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fan-out point for scheduling events.
///
/// `emit` must never stall the scheduler tick, so the durable path is a
/// bounded channel serviced by [`EventWriter`] and overflow is counted and
/// dropped (the tracing output still sees every event). Live consumers
/// subscribe to a broadcast channel.
pub struct EventHub {
    tx: mpsc::Sender<StoredEvent>,
    live: broadcast::Sender<Event>,
    dropped: AtomicU64,
}

impl EventHub {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<StoredEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let hub = Arc::new(Self {
            tx,
            live: broadcast::channel(buffer.max(1)).0,
            dropped: AtomicU64::new(0),
        });

        (hub, rx)
    }

    pub fn emit(&self, event: Event) {
        tracing::debug!(target: "olt_poller::event", kind = event.kind(), ?event);
        metrics::counter!("poller_events_total", "kind" => event.kind()).increment(1);

        let stored = StoredEvent {
            at: Utc::now(),
            kind: event.kind(),
            device_id: event.device_id(),
            master_id: event.master_id(),
            payload: serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        };

        if self.tx.try_send(stored).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("poller_events_dropped_total").increment(1);
        }

        let _ = self.live.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains the hub's channel into the durable sink in batches.
///
/// Runs until every [`EventHub`] handle is gone, so the final shutdown event
/// is flushed before the writer exits.
pub struct EventWriter {
    rx: mpsc::Receiver<StoredEvent>,
    sink: Arc<dyn EventSink>,
}

impl EventWriter {
    pub fn new(rx: mpsc::Receiver<StoredEvent>, sink: Arc<dyn EventSink>) -> Self {
        Self { rx, sink }
    }

    pub async fn run(mut self) {
        let mut batch = Vec::with_capacity(128);

        loop {
            batch.clear();

            if self.rx.recv_many(&mut batch, 128).await == 0 {
                break;
            }

            // A sink failure never propagates: the log is an observability
            // surface, losing a batch must not take the coordinator down.
            if let Err(e) = self.sink.append(&batch).await {
                tracing::warn!("failed to append {} events: {e:#}", batch.len());
            }
        }
    }
}
