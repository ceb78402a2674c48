use std::sync::Arc;

use chrono::Utc;

use crate::config::Config;
use crate::event::{Event, EventHub};
use crate::model::{Composite, QueueEntry};
use crate::pool::PollerPool;
use crate::store::{
    creation_lock_key, drain_lock_key, Admission, Lease, LockManager, Offer, QueueStore, Repository,
};

/// Where a submission ended up.
///
/// Refusals are recorded scheduling decisions, not errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A worker slot took the composite.
    Dispatched { execution_id: i64, slot: usize },
    /// The device is busy; the composite waits in its device queue.
    Queued,
    /// Every slot is busy; the composite waits in its device queue.
    QueuedPoolFull,
    /// The (device, master) pair is already in flight or queued.
    DuplicateSuppressed,
    /// The master ran too recently.
    TooSoon,
    /// The device queue is past its soft limit.
    Overloaded,
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Dispatched { .. } => "dispatched",
            DispatchOutcome::Queued => "queued",
            DispatchOutcome::QueuedPoolFull => "queued_pool_full",
            DispatchOutcome::DuplicateSuppressed => "duplicate_suppressed",
            DispatchOutcome::TooSoon => "too_soon",
            DispatchOutcome::Overloaded => "overloaded",
        }
    }
}

/// Routes composites to a worker slot or the device queue.
///
/// Admission is one atomic decision per device: correctness rests on
/// [`Repository::try_admit`]'s uniqueness predicate, with a short-TTL
/// creation lock in front to serialize concurrent submissions of the same
/// (device, master) pair across processes.
pub struct Dispatcher {
    config: Config,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn QueueStore>,
    locks: Arc<dyn LockManager>,
    pool: PollerPool,
    hub: Arc<EventHub>,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        queue: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        pool: PollerPool,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            config,
            repo,
            queue,
            locks,
            pool,
            hub,
        }
    }

    pub fn pool(&self) -> &PollerPool {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub async fn submit(self: &Arc<Self>, composite: Composite) -> anyhow::Result<DispatchOutcome> {
        let device_id = composite.device.id;
        let master_id = composite.master.id;

        let lease = self.acquire_creation_lock(device_id, master_id).await;
        if let CreationLock::Contended = lease {
            // Another dispatcher is deciding this same pair right now.
            self.hub.emit(Event::DuplicateSuppressed {
                device_id,
                master_id,
            });
            return self.decided(device_id, master_id, DispatchOutcome::DuplicateSuppressed);
        }

        let outcome = self.decide(composite).await;

        if let CreationLock::Held(lease) = lease {
            if let Err(e) = self.locks.release(lease).await {
                tracing::debug!("failed to release creation lock (ttl will expire it): {e:#}");
            }
        }

        self.decided(device_id, master_id, outcome?)
    }

    fn decided(
        &self,
        device_id: i64,
        master_id: i64,
        outcome: DispatchOutcome,
    ) -> anyhow::Result<DispatchOutcome> {
        self.hub.emit(Event::DispatchDecision {
            device_id,
            master_id,
            outcome: outcome.label().to_string(),
        });
        metrics::counter!("poller_dispatch_total", "outcome" => outcome.label()).increment(1);

        Ok(outcome)
    }

    async fn decide(self: &Arc<Self>, composite: Composite) -> anyhow::Result<DispatchOutcome> {
        let device_id = composite.device.id;
        let master_id = composite.master.id;
        let now = Utc::now();

        // Dedup comes before every other branch: a pair already in flight or
        // waiting is silently suppressed.
        if self.repo.has_in_flight(device_id, master_id).await?
            || self.queue.contains(device_id, master_id).await?
        {
            self.hub.emit(Event::DuplicateSuppressed {
                device_id,
                master_id,
            });
            return Ok(DispatchOutcome::DuplicateSuppressed);
        }

        // The recent-run guard is event-based: it also covers wall-clock
        // jumps backwards, where `now - last_run_at` goes negative. Capped by
        // the master's own interval so short-interval probes still run every
        // tick.
        if let Some(last_run_at) = composite.master.last_run_at {
            let guard = chrono::Duration::from_std(self.config.recent_run_guard)
                .unwrap_or_else(|_| chrono::Duration::seconds(3))
                .min(chrono::Duration::seconds(composite.master.interval_secs));
            if now - last_run_at < guard {
                self.hub.emit(Event::TooSoon {
                    device_id,
                    master_id,
                });
                return Ok(DispatchOutcome::TooSoon);
            }
        }

        if self.repo.device_busy(device_id).await? {
            return self.enqueue(&composite, false).await;
        }

        let Some(claim) = self.pool.try_claim() else {
            return self.enqueue(&composite, true).await;
        };

        match self.repo.try_admit(device_id, master_id, now).await? {
            Admission::Admitted { execution_id } => {
                let slot = claim.slot();
                self.pool
                    .start(claim, composite, execution_id, Arc::clone(self));
                Ok(DispatchOutcome::Dispatched { execution_id, slot })
            }
            // Lost the race for the device between the check and the insert.
            Admission::DeviceBusy => {
                drop(claim);
                self.enqueue(&composite, false).await
            }
            Admission::DuplicateMaster => {
                drop(claim);
                self.hub.emit(Event::DuplicateSuppressed {
                    device_id,
                    master_id,
                });
                Ok(DispatchOutcome::DuplicateSuppressed)
            }
        }
    }

    async fn enqueue(
        &self,
        composite: &Composite,
        pool_full: bool,
    ) -> anyhow::Result<DispatchOutcome> {
        let device_id = composite.device.id;
        let master_id = composite.master.id;

        let entry = QueueEntry {
            device_id,
            master_id,
            priority: composite.master.priority,
            delay_score: composite.delay_secs,
            enqueued_at: Utc::now(),
        };

        match self.queue.offer(entry).await? {
            Offer::Accepted => {
                self.hub.emit(Event::Queued {
                    device_id,
                    master_id,
                    pool_full,
                });

                if pool_full {
                    Ok(DispatchOutcome::QueuedPoolFull)
                } else {
                    Ok(DispatchOutcome::Queued)
                }
            }
            Offer::AlreadyQueued => {
                self.hub.emit(Event::DuplicateSuppressed {
                    device_id,
                    master_id,
                });
                Ok(DispatchOutcome::DuplicateSuppressed)
            }
            Offer::Overloaded { size } => {
                self.hub.emit(Event::Overload {
                    device_id,
                    master_id,
                    size,
                });
                tracing::warn!(
                    device_id,
                    master_id,
                    size,
                    "device queue past its soft limit, offer refused"
                );
                Ok(DispatchOutcome::Overloaded)
            }
        }
    }

    /// Pull the best waiting entry for a device and push it back through
    /// [`Dispatcher::submit`].
    ///
    /// Called by the completion callback the moment a device frees (under the
    /// device's drain lock) and by the scheduler tick as the fallback path.
    /// Best effort by contract: a failure here only delays the entry until
    /// the next tick.
    pub async fn drain_device(
        self: &Arc<Self>,
        device_id: i64,
    ) -> anyhow::Result<Option<DispatchOutcome>> {
        let key = drain_lock_key(device_id);
        let Some(lease) = self
            .locks
            .try_acquire(&key, self.config.drain_lock_ttl)
            .await?
        else {
            // Another process is draining this device.
            return Ok(None);
        };

        let result = async {
            let Some(entry) = self.queue.poll(device_id).await? else {
                return Ok(None);
            };

            let Some((device, master)) = self.repo.load_master(entry.master_id).await? else {
                tracing::warn!(
                    master_id = entry.master_id,
                    "queued master no longer exists, dropping entry"
                );
                return Ok(None);
            };

            let followers = self.repo.load_followers(master.id).await?;
            let composite = Composite::assemble(device, master, followers, Utc::now());
            let outcome = self.submit(composite).await?;
            tracing::debug!(
                device_id,
                master_id = entry.master_id,
                ?outcome,
                "drained queue entry"
            );

            Ok(Some(outcome))
        }
        .await;

        if let Err(e) = self.locks.release(lease).await {
            tracing::debug!(
                device_id,
                "failed to release drain lock (ttl will expire it): {e:#}"
            );
        }

        result
    }

    async fn acquire_creation_lock(&self, device_id: i64, master_id: i64) -> CreationLock {
        let key = creation_lock_key(device_id, master_id);
        match self
            .locks
            .try_acquire(&key, self.config.creation_lock_ttl)
            .await
        {
            Ok(Some(lease)) => CreationLock::Held(lease),
            Ok(None) => CreationLock::Contended,
            Err(e) => {
                // The lock is an optimisation; admission stays correct
                // without it.
                tracing::warn!("creation lock acquisition failed, proceeding unlocked: {e:#}");
                CreationLock::Unlocked
            }
        }
    }
}

enum CreationLock {
    Held(Lease),
    Contended,
    Unlocked,
}
