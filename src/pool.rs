//! The poller pool: a fixed set of worker slots executing composites.
//!
//! Each slot runs at most one composite at a time. The completion callback
//! (schedule advance, queue drain) runs on the worker task itself, before the
//! slot transitions back to free, so a backed-up device can run its next
//! probe without waiting for the next tick.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::{Event, EventHub};
use crate::flag::ShutdownFlag;
use crate::model::{Composite, CompositePhase, Device, ExecutionStatus, Node};
use crate::probe::{ProbeExecutor, ProbeReport};
use crate::store::{Finalization, QueueStore, Repository};

#[derive(Clone, Debug)]
struct BusyInfo {
    device_id: i64,
    master_id: i64,
    execution_id: i64,
    phase: CompositePhase,
    since: Instant,
}

struct SlotState {
    busy: Option<BusyInfo>,
    reserved: bool,
    /// Completed busy spans inside the sliding window, oldest first.
    spans: VecDeque<(Instant, Instant)>,
    completed: u64,
    completed_delayed: u64,
}

impl SlotState {
    fn new() -> Self {
        Self {
            busy: None,
            reserved: false,
            spans: VecDeque::new(),
            completed: 0,
            completed_delayed: 0,
        }
    }

    fn is_free(&self) -> bool {
        self.busy.is_none() && !self.reserved
    }
}

pub(crate) struct PoolShared {
    pub config: Config,
    pub repo: Arc<dyn Repository>,
    pub queue: Arc<dyn QueueStore>,
    pub executor: Arc<dyn ProbeExecutor>,
    pub hub: Arc<EventHub>,
    pub shutdown: ShutdownFlag,
    /// Raised when the shutdown grace expires; aborts in-flight probe calls.
    pub abort: ShutdownFlag,
    /// Stable identity of this process; slot workers append their slot id.
    pub ident: String,

    slots: Mutex<Vec<SlotState>>,
    busy_count: AtomicUsize,
    accepting: AtomicBool,
    freed: Notify,
    finished_total: AtomicU64,
    interrupted_total: AtomicU64,
}

/// A reserved slot, not yet running anything.
///
/// Dropping the claim without starting it returns the slot to the free set,
/// so a failed admission can never leak a slot.
pub(crate) struct SlotClaim {
    shared: Arc<PoolShared>,
    slot: usize,
    started: bool,
}

impl SlotClaim {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        if !self.started {
            let mut slots = self.shared.slots.lock();
            slots[self.slot].reserved = false;
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SlotView {
    pub slot: usize,
    pub state: &'static str,
    pub device_id: Option<i64>,
    pub master_id: Option<i64>,
    pub execution_id: Option<i64>,
    pub phase: Option<CompositePhase>,
    pub busy_ms: Option<u64>,
    pub completed: u64,
    pub completed_delayed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub busy: usize,
    /// Busy time share over the sliding window, 0 to 100.
    pub busy_pct: f64,
    /// Pending entries across all device queues.
    pub queued: u64,
    pub saturated: bool,
}

#[derive(Clone)]
pub struct PollerPool {
    shared: Arc<PoolShared>,
}

impl PollerPool {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        queue: Arc<dyn QueueStore>,
        executor: Arc<dyn ProbeExecutor>,
        hub: Arc<EventHub>,
        shutdown: ShutdownFlag,
        ident: String,
    ) -> Self {
        let slots = (0..config.pool_size).map(|_| SlotState::new()).collect();

        Self {
            shared: Arc::new(PoolShared {
                config,
                repo,
                queue,
                executor,
                hub,
                shutdown,
                abort: ShutdownFlag::new(),
                ident,
                slots: Mutex::new(slots),
                busy_count: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                freed: Notify::new(),
                finished_total: AtomicU64::new(0),
                interrupted_total: AtomicU64::new(0),
            }),
        }
    }

    /// Reserve a free slot, if any. The claim is handed back through
    /// [`PollerPool::start`] once admission has succeeded.
    pub(crate) fn try_claim(&self) -> Option<SlotClaim> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return None;
        }

        let mut slots = self.shared.slots.lock();
        let slot = slots.iter().position(|s| s.is_free())?;
        slots[slot].reserved = true;

        Some(SlotClaim {
            shared: self.shared.clone(),
            slot,
            started: false,
        })
    }

    /// Begin executing a composite on a previously claimed slot.
    pub(crate) fn start(
        &self,
        mut claim: SlotClaim,
        composite: Composite,
        execution_id: i64,
        dispatcher: Arc<Dispatcher>,
    ) {
        let slot = claim.slot;
        claim.started = true;

        {
            let mut slots = self.shared.slots.lock();
            let state = &mut slots[slot];
            state.reserved = false;
            state.busy = Some(BusyInfo {
                device_id: composite.device.id,
                master_id: composite.master.id,
                execution_id,
                phase: CompositePhase::Created,
                since: Instant::now(),
            });
        }
        self.shared.busy_count.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("poller_pool_busy_slots")
            .set(self.shared.busy_count.load(Ordering::Acquire) as f64);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_composite(shared, slot, composite, execution_id, dispatcher).await;
        });
    }

    /// Execution ids currently held by live workers. Cross-checked by the
    /// delivery watchdog before it reclassifies anything.
    pub fn in_flight_executions(&self) -> Vec<i64> {
        self.shared
            .slots
            .lock()
            .iter()
            .filter_map(|s| s.busy.as_ref().map(|b| b.execution_id))
            .collect()
    }

    pub fn slot_views(&self) -> Vec<SlotView> {
        let now = Instant::now();
        self.shared
            .slots
            .lock()
            .iter()
            .enumerate()
            .map(|(slot, state)| match &state.busy {
                Some(busy) => SlotView {
                    slot,
                    state: "busy",
                    device_id: Some(busy.device_id),
                    master_id: Some(busy.master_id),
                    execution_id: Some(busy.execution_id),
                    phase: Some(busy.phase),
                    busy_ms: Some(now.duration_since(busy.since).as_millis() as u64),
                    completed: state.completed,
                    completed_delayed: state.completed_delayed,
                },
                None => SlotView {
                    slot,
                    state: "free",
                    device_id: None,
                    master_id: None,
                    execution_id: None,
                    phase: None,
                    busy_ms: None,
                    completed: state.completed,
                    completed_delayed: state.completed_delayed,
                },
            })
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let queued = self.shared.queue.total_size().await.unwrap_or(0);
        self.stats_with_queued(queued)
    }

    pub(crate) fn stats_with_queued(&self, queued: u64) -> PoolStats {
        let window = self.shared.config.busy_window;
        let now = Instant::now();
        let slots = self.shared.slots.lock();

        let total = slots.len();
        let busy = slots.iter().filter(|s| s.busy.is_some()).count();
        let busy_time: Duration = slots
            .iter()
            .map(|s| {
                let spans = s.spans.iter().copied();
                let current = s.busy.as_ref().map(|b| (b.since, now));
                window_busy_time(spans.chain(current), now, window)
            })
            .sum();

        let capacity = window.as_secs_f64() * total as f64;
        let busy_pct = if capacity > 0.0 {
            (busy_time.as_secs_f64() / capacity * 100.0).min(100.0)
        } else {
            0.0
        };

        let saturated = busy_pct > self.shared.config.saturation_busy_pct
            || queued > self.shared.config.saturation_queue_factor * total as u64;

        PoolStats {
            total,
            free: total - busy,
            busy,
            busy_pct,
            queued,
            saturated,
        }
    }

    /// Shutdown hook: refuse new assignments, give in-flight composites the
    /// configured grace to finish, then abort whatever is left. Returns the
    /// lifetime (finished, interrupted) counters.
    pub async fn drain(&self) -> (u64, u64) {
        self.shared.accepting.store(false, Ordering::Release);

        let deadline = Instant::now() + self.shared.config.shutdown_grace;
        self.wait_for_idle(deadline).await;

        if self.shared.busy_count.load(Ordering::Acquire) > 0 {
            tracing::warn!("shutdown grace expired, aborting in-flight probes");
            self.shared.abort.raise();

            // Aborted workers only have their finalization writes left.
            self.wait_for_idle(Instant::now() + Duration::from_secs(5)).await;
        }

        (
            self.shared.finished_total.load(Ordering::Acquire),
            self.shared.interrupted_total.load(Ordering::Acquire),
        )
    }

    async fn wait_for_idle(&self, deadline: Instant) {
        loop {
            // Register before the check so a slot freed in between still
            // wakes us.
            let freed = self.shared.freed.notified();
            if self.shared.busy_count.load(Ordering::Acquire) == 0 {
                return;
            }

            tokio::select! {
                _ = freed => (),
                _ = tokio::time::sleep_until(deadline) => return,
            }
        }
    }
}

/// Total overlap of the given busy spans with the trailing window.
fn window_busy_time(
    spans: impl Iterator<Item = (Instant, Instant)>,
    now: Instant,
    window: Duration,
) -> Duration {
    let window_start = now.checked_sub(window).unwrap_or(now);

    spans
        .map(|(start, end)| {
            let start = start.max(window_start);
            let end = end.min(now);
            end.saturating_duration_since(start)
        })
        .sum()
}

fn set_phase(shared: &PoolShared, slot: usize, phase: CompositePhase) {
    let mut slots = shared.slots.lock();
    if let Some(busy) = slots[slot].busy.as_mut() {
        busy.phase = phase;
    }
}

/// Run one probe out-call, containing panics and honoring the abort signal.
async fn run_probe(shared: &PoolShared, device: &Device, node: &Node) -> ProbeReport {
    let start = Instant::now();
    let call = AssertUnwindSafe(shared.executor.execute(device, node)).catch_unwind();

    tokio::select! {
        biased;

        _ = shared.abort.wait() => ProbeReport {
            status: ExecutionStatus::Interrupted,
            summary: serde_json::json!({ "error": "aborted by shutdown" }),
            duration: start.elapsed(),
        },
        result = call => match result {
            Ok(report) => report,
            Err(payload) => {
                let message: &str = if let Some(message) = payload.downcast_ref::<String>() {
                    message
                } else if let Some(message) = payload.downcast_ref::<&str>() {
                    message
                } else {
                    "Box<dyn Any>"
                };

                tracing::error!(
                    device_id = device.id,
                    node_id = node.id,
                    "probe panicked: {message}"
                );

                ProbeReport::failed(format!("probe panicked: {message}"), start.elapsed())
            }
        },
    }
}

async fn run_composite(
    shared: Arc<PoolShared>,
    slot: usize,
    composite: Composite,
    execution_id: i64,
    dispatcher: Arc<Dispatcher>,
) {
    let device_id = composite.device.id;
    let master_id = composite.master.id;
    let worker = format!("{}/{slot}", shared.ident);
    let started_at = Utc::now();

    let outcome = async {
        // Cancelled before starting: the row is closed out as interrupted and
        // the master is left untouched for the next tick.
        if shared.shutdown.is_raised() {
            finalize(
                &shared,
                execution_id,
                master_id,
                ExecutionStatus::Interrupted,
                serde_json::json!({ "error": "shutdown before start" }),
                Utc::now(),
                None,
            )
            .await;
            return ExecutionStatus::Interrupted;
        }

        match shared
            .repo
            .mark_running(execution_id, &worker, started_at)
            .await
        {
            Ok(true) => (),
            Ok(false) => {
                // The row was recovered or finalized elsewhere; nothing to run.
                tracing::debug!(execution_id, "execution no longer pending, skipping");
                return ExecutionStatus::Interrupted;
            }
            Err(e) => {
                tracing::error!(execution_id, "failed to mark execution running: {e:#}");
                return ExecutionStatus::Interrupted;
            }
        }

        shared.hub.emit(Event::TaskStarted {
            device_id,
            master_id,
            execution_id,
            slot,
        });

        set_phase(&shared, slot, CompositePhase::RunningMaster);
        let master_report = run_probe(&shared, &composite.device, &composite.master).await;
        let mut status = master_report.status;
        let mut follower_reports = Vec::new();

        // Followers run only after master success, in declared order; the
        // first failure skips the rest.
        if status == ExecutionStatus::Success {
            for (index, follower) in composite.followers.iter().enumerate() {
                set_phase(&shared, slot, CompositePhase::RunningFollower(index));
                let report = run_probe(&shared, &composite.device, follower).await;
                let follower_status = report.status;
                let succeeded = follower_status == ExecutionStatus::Success;

                if let Err(e) = shared
                    .repo
                    .touch_follower(follower.id, Utc::now(), succeeded)
                    .await
                {
                    tracing::warn!(follower_id = follower.id, "failed to record follower run: {e:#}");
                }

                follower_reports.push(serde_json::json!({
                    "node_id": follower.id,
                    "status": follower_status,
                    "summary": report.summary,
                }));

                if !succeeded {
                    status = follower_status;
                    break;
                }
            }
        }

        let finished_at = Utc::now();
        set_phase(&shared, slot, CompositePhase::Completed(status));

        // Shutdown interruptions do not advance the master; everything else
        // schedules the next run off the finish instant.
        let next_run_at = if status == ExecutionStatus::Interrupted {
            None
        } else {
            Some(finished_at + chrono::Duration::seconds(composite.master.interval_secs))
        };

        let summary = serde_json::json!({
            "master": master_report.summary,
            "followers": follower_reports,
        });

        finalize(
            &shared,
            execution_id,
            master_id,
            status,
            summary,
            finished_at,
            next_run_at,
        )
        .await;

        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        shared.hub.emit(Event::TaskCompleted {
            device_id,
            master_id,
            execution_id,
            status,
            duration_ms,
        });
        metrics::counter!(
            "poller_tasks_completed_total",
            "status" => status_label(status)
        )
        .increment(1);
        metrics::histogram!("poller_task_duration_seconds").record(duration_ms as f64 / 1000.0);

        status
    }
    .await;

    match outcome {
        ExecutionStatus::Interrupted => {
            shared.interrupted_total.fetch_add(1, Ordering::AcqRel);
        }
        _ => {
            shared.finished_total.fetch_add(1, Ordering::AcqRel);
        }
    }

    free_slot(&shared, slot, composite.delayed);
    shared.hub.emit(Event::SlotFreed { slot, device_id });

    // The immediate-drain optimisation: hand the device's next queued
    // composite to the dispatcher right away instead of waiting for the next
    // tick. Best effort; the tick drains regardless.
    if !shared.shutdown.is_raised() {
        if let Err(e) = dispatcher.drain_device(device_id).await {
            tracing::warn!(device_id, "queue drain after completion failed: {e:#}");
        }
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Interrupted => "interrupted",
    }
}

async fn finalize(
    shared: &PoolShared,
    execution_id: i64,
    master_id: i64,
    status: ExecutionStatus,
    summary: serde_json::Value,
    finished_at: chrono::DateTime<Utc>,
    next_run_at: Option<chrono::DateTime<Utc>>,
) {
    let result = shared
        .repo
        .finalize(Finalization {
            execution_id,
            master_id,
            status,
            summary,
            finished_at,
            next_run_at,
            clear_gates: status == ExecutionStatus::Success,
        })
        .await;

    match result {
        Ok(true) => (),
        Ok(false) => tracing::debug!(execution_id, "execution already finalized"),
        Err(e) => tracing::error!(execution_id, "failed to finalize execution: {e:#}"),
    }
}

fn free_slot(shared: &PoolShared, slot: usize, delayed: bool) {
    let now = Instant::now();
    {
        let mut slots = shared.slots.lock();
        let state = &mut slots[slot];
        if let Some(busy) = state.busy.take() {
            state.spans.push_back((busy.since, now));
        }
        state.completed += 1;
        if delayed {
            state.completed_delayed += 1;
        }

        // Spans entirely outside the window no longer contribute.
        let window = shared.config.busy_window;
        let horizon = now.checked_sub(window).unwrap_or(now);
        while state.spans.front().is_some_and(|(_, end)| *end < horizon) {
            state.spans.pop_front();
        }
    }

    shared.busy_count.fetch_sub(1, Ordering::AcqRel);
    metrics::gauge!("poller_pool_busy_slots")
        .set(shared.busy_count.load(Ordering::Acquire) as f64);
    shared.freed.notify_waiters();
}
