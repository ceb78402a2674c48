//! The scheduler tick loop.
//!
//! Exactly one instance runs cluster-wide (the deployment guarantees it).
//! Each tick scans ready masters, assembles composites, orders them, and
//! submits everything to the dispatcher. Ticks are idempotent: re-submitting
//! in-flight work is the dispatcher's problem, not the scheduler's.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::event::{Event, EventHub};
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::model::Composite;
use crate::store::Repository;

/// Shared liveness view of the tick loop, read by the health endpoint.
#[derive(Clone, Default)]
pub struct TickHealth(Arc<TickHealthInner>);

#[derive(Default)]
struct TickHealthInner {
    last_ok_unix_ms: AtomicI64,
    consecutive_failures: AtomicU32,
}

impl TickHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_ok(&self) {
        self.0
            .last_ok_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.0.consecutive_failures.store(0, Ordering::Release);
    }

    fn mark_failed(&self) {
        self.0.consecutive_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn last_ok_age(&self) -> Option<Duration> {
        let at = self.0.last_ok_unix_ms.load(Ordering::Acquire);
        if at == 0 {
            return None;
        }

        let age = Utc::now().timestamp_millis().saturating_sub(at);
        Some(Duration::from_millis(age.max(0) as u64))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.0.consecutive_failures.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickSummary {
    /// Masters repaired from a null `next_run_at`.
    pub repaired: usize,
    /// Composites in the ready-set.
    pub ready: usize,
    /// Composites a worker slot accepted this tick.
    pub dispatched: usize,
    /// Backlogged free devices drained this tick.
    pub drained: usize,
}

pub struct Scheduler {
    config: Config,
    repo: Arc<dyn Repository>,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    shutdown: ShutdownFlag,
    health: TickHealth,
}

impl Scheduler {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        dispatcher: Arc<Dispatcher>,
        hub: Arc<EventHub>,
        shutdown: ShutdownFlag,
        health: TickHealth,
    ) -> Self {
        Self {
            config,
            repo,
            dispatcher,
            hub,
            shutdown,
            health,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let _guard = ShutdownGuard::new(&self.shutdown);

        let mut interval = tokio::time::interval(self.config.tick_period);
        // Missed ticks are not replayed; a probe that missed its instant
        // simply runs on the next scan.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut consecutive_overruns: u32 = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break,
                _ = interval.tick() => (),
            }

            let started = Instant::now();

            // A tick failure of any kind terminates that tick only; the next
            // one retries from scratch.
            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(summary)) => {
                    self.health.mark_ok();
                    tracing::trace!(?summary, "tick complete");
                }
                Ok(Err(e)) => {
                    self.health.mark_failed();
                    metrics::counter!("poller_tick_failures_total").increment(1);
                    tracing::error!("tick aborted: {e:#}");
                }
                Err(_) => {
                    self.health.mark_failed();
                    metrics::counter!("poller_tick_panics_total").increment(1);
                    tracing::error!("tick panicked");
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.config.tick_period {
                consecutive_overruns += 1;
                metrics::counter!("poller_tick_overruns_total").increment(1);
                if consecutive_overruns >= self.config.overrun_tolerance {
                    tracing::warn!(
                        "scheduler tick overran its period {} times in a row \
                         (last took {:.3}s)",
                        consecutive_overruns,
                        elapsed.as_secs_f64()
                    );
                }
            } else {
                consecutive_overruns = 0;
            }
        }

        Ok(())
    }

    /// One full scan. Public for the out-of-band surfaces and the tests; the
    /// loop above is just this on a timer.
    pub async fn tick(&self) -> anyhow::Result<TickSummary> {
        let now = Utc::now();
        let mut summary = TickSummary::default();

        // Masters lose their next_run_at only through crashes or manual
        // edits; repair them before the ready scan so they are not invisible
        // forever.
        let repaired = self.repo.repair_missing_next_runs(now).await?;
        summary.repaired = repaired.len();
        for (master_id, next_run_at) in repaired {
            self.hub.emit(Event::NextRunInitialized {
                master_id,
                next_run_at,
            });
        }

        let mut composites = Vec::new();
        for (device, master) in self.repo.load_ready_masters(now).await? {
            if let Err(reason) = master.validate() {
                tracing::warn!(master_id = master.id, "skipping misconfigured node: {reason}");
                metrics::counter!("poller_nodes_skipped_total").increment(1);
                continue;
            }

            let followers = self.repo.load_followers(master.id).await?;
            composites.push(Composite::assemble(device, master, followers, now));
        }

        composites.sort_by(|a, b| b.ready_key().cmp(&a.ready_key()));
        summary.ready = composites.len();

        self.hub.emit(Event::TickStart {
            at: now,
            ready: composites.len(),
        });
        metrics::counter!("poller_ticks_total").increment(1);

        for composite in composites {
            match self.dispatcher.submit(composite).await? {
                DispatchOutcome::Dispatched { .. } => summary.dispatched += 1,
                _ => (),
            }
        }

        summary.drained = self.drain_backlogged_devices().await?;

        Ok(summary)
    }

    /// The tick-level fallback for the completion callback's immediate
    /// drain: any free device with queued work gets its best entry
    /// re-submitted.
    async fn drain_backlogged_devices(&self) -> anyhow::Result<usize> {
        let mut drained = 0;

        for (device_id, _) in self.dispatcher.queue().sizes().await? {
            if self.repo.device_busy(device_id).await? {
                continue;
            }

            if let Some(DispatchOutcome::Dispatched { .. }) =
                self.dispatcher.drain_device(device_id).await?
            {
                drained += 1;
            }
        }

        Ok(drained)
    }
}
