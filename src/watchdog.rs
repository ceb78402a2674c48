//! The delivery watchdog.
//!
//! An execution can be admitted (`pending` row written, device held) and then
//! never reach a worker: the process died between the insert and the spawn,
//! or the slot task was lost. Left alone such a row pins its device forever.
//! The watchdog sweeps for them, double-checks against the live in-flight
//! set, and puts the work back through the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::Instant;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::{Event, EventHub};
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::model::Composite;
use crate::store::Repository;

pub struct Watchdog {
    config: Config,
    repo: Arc<dyn Repository>,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    shutdown: ShutdownFlag,
}

impl Watchdog {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        dispatcher: Arc<Dispatcher>,
        hub: Arc<EventHub>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            config,
            repo,
            dispatcher,
            hub,
            shutdown,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let _guard = ShutdownGuard::new(&self.shutdown);
        let mut next = Instant::now() + self.config.watchdog_period;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep_until(next) => (),
            }

            if let Err(e) = self.sweep().await {
                tracing::warn!("orphan sweep failed: {e:#}");
            }

            let mut period = self.config.watchdog_period;
            let jitter = rand::thread_rng().gen_range(0..(period / 4).as_nanos().max(1));
            period -= Duration::from_nanos(jitter as u64);

            next += period;
        }

        Ok(())
    }

    pub async fn sweep(&self) -> anyhow::Result<usize> {
        // Under saturation the pool may genuinely not have gotten to the
        // work yet; reclassifying would only thrash. Wait for headroom.
        let stats = self.dispatcher.pool().stats().await;
        if stats.saturated {
            tracing::debug!("pool saturated, deferring orphan sweep");
            return Ok(0);
        }

        let older_than = Utc::now()
            - chrono::Duration::from_std(self.config.orphan_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let orphans = self.repo.find_orphaned(older_than).await?;
        if orphans.is_empty() {
            return Ok(0);
        }

        let in_flight = self.dispatcher.pool().in_flight_executions();
        let mut recovered = 0;

        for row in orphans {
            // A live worker may still be holding the composite without
            // having written its identity yet.
            if in_flight.contains(&row.id) {
                continue;
            }

            // The rewrite races against a late pickup; the store arbitrates.
            if !self.repo.interrupt_orphan(row.id).await? {
                continue;
            }

            self.hub.emit(Event::OrphanRecovered {
                device_id: row.device_id,
                master_id: row.master_id,
                execution_id: row.id,
            });
            metrics::counter!("poller_orphans_recovered_total").increment(1);
            recovered += 1;

            let Some((device, master)) = self.repo.load_master(row.master_id).await? else {
                continue;
            };
            let followers = self.repo.load_followers(master.id).await?;
            let composite = Composite::assemble(device, master, followers, Utc::now());

            let outcome = self.dispatcher.submit(composite).await?;
            tracing::info!(
                execution_id = row.id,
                master_id = row.master_id,
                outcome = outcome.label(),
                "recovered orphaned execution"
            );
        }

        Ok(recovered)
    }
}
