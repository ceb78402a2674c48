//! Process assembly: wires the scheduler, pool, dispatcher, watchdog, event
//! writer and control surface together under one shutdown flag.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_concurrency::future::Join;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::{Event, EventHub, EventSink, EventWriter, NullEventSink};
use crate::flag::ShutdownFlag;
use crate::http::{self, AppState};
use crate::pool::PollerPool;
use crate::probe::ProbeExecutor;
use crate::scheduler::{Scheduler, TickHealth};
use crate::store::{LockManager, QueueStore, Repository};
use crate::watchdog::Watchdog;

pub struct RuntimeBuilder {
    config: Config,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn QueueStore>,
    locks: Arc<dyn LockManager>,
    executor: Arc<dyn ProbeExecutor>,
    sink: Arc<dyn EventSink>,
    http_addr: Option<SocketAddr>,
}

impl RuntimeBuilder {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        executor: Arc<dyn ProbeExecutor>,
    ) -> Self {
        Self {
            config: Config::default(),
            repo,
            queue,
            locks,
            executor,
            sink: Arc::new(NullEventSink),
            http_addr: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Durable destination for the event log. Without one, events only reach
    /// the tracing output.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Bind address for the control surface. Without one, no HTTP server is
    /// started.
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            config: self.config,
            repo: self.repo,
            queue: self.queue,
            locks: self.locks,
            executor: self.executor,
            sink: self.sink,
            http_addr: self.http_addr,
            shutdown: ShutdownFlag::new(),
        }
    }
}

pub struct RuntimeHandle {
    shutdown: ShutdownFlag,
}

impl RuntimeHandle {
    pub fn shutdown(&self) {
        self.shutdown.raise();
    }
}

pub struct Runtime {
    config: Config,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn QueueStore>,
    locks: Arc<dyn LockManager>,
    executor: Arc<dyn ProbeExecutor>,
    sink: Arc<dyn EventSink>,
    http_addr: Option<SocketAddr>,
    shutdown: ShutdownFlag,
}

impl Runtime {
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        let ident = Uuid::new_v4().to_string();
        tracing::info!("poller coordinator identity is {ident}");

        let (hub, rx) = EventHub::new(self.config.event_buffer);
        let writer = tokio::spawn(EventWriter::new(rx, self.sink.clone()).run());

        let pool = PollerPool::new(
            self.config.clone(),
            self.repo.clone(),
            self.queue.clone(),
            self.executor.clone(),
            hub.clone(),
            self.shutdown.clone(),
            ident,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            self.config.clone(),
            self.repo.clone(),
            self.queue.clone(),
            self.locks.clone(),
            pool.clone(),
            hub.clone(),
        ));

        let health = TickHealth::new();
        let scheduler = Scheduler::new(
            self.config.clone(),
            self.repo.clone(),
            dispatcher.clone(),
            hub.clone(),
            self.shutdown.clone(),
            health.clone(),
        );
        let watchdog = Watchdog::new(
            self.config.clone(),
            self.repo.clone(),
            dispatcher.clone(),
            hub.clone(),
            self.shutdown.clone(),
        );

        let http = {
            let addr = self.http_addr;
            let state = AppState::new(dispatcher.clone(), health.clone());
            let shutdown = self.shutdown.clone();
            async move {
                match addr {
                    Some(addr) => http::serve(addr, state, shutdown).await,
                    None => {
                        shutdown.wait().await;
                        Ok(())
                    }
                }
            }
        };

        let retention = self.retention_sweep();

        // One task for all the long-running loops: any of them exiting raises
        // the shutdown flag (via its guard), which stops the others.
        let (scheduler_result, watchdog_result, http_result, retention_result) =
            (scheduler.run(), watchdog.run(), http, retention).join().await;

        let (finished, interrupted) = pool.drain().await;
        hub.emit(Event::Shutdown {
            finished,
            interrupted,
        });

        // Everything holding a hub handle is torn down before the writer is
        // awaited, so the shutdown event itself gets flushed.
        drop(scheduler);
        drop(watchdog);
        drop(hub);
        drop(pool);
        drop(dispatcher);
        if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
            tracing::warn!("event writer did not flush in time");
        }

        tracing::info!(finished, interrupted, "poller coordinator stopped");

        scheduler_result?;
        watchdog_result?;
        http_result?;
        retention_result?;

        Ok(())
    }

    async fn retention_sweep(&self) -> anyhow::Result<()> {
        let Some(horizon) = self.config.event_retention else {
            self.shutdown.wait().await;
            return Ok(());
        };

        let period = horizon.min(Duration::from_secs(3600)).max(Duration::from_secs(60));

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(period) => (),
            }

            let older_than = chrono::Utc::now()
                - chrono::Duration::from_std(horizon)
                    .unwrap_or_else(|_| chrono::Duration::days(3650));
            match self.sink.prune(older_than).await {
                Ok(0) => (),
                Ok(n) => tracing::debug!("pruned {n} events past the retention horizon"),
                Err(e) => tracing::warn!("event retention sweep failed: {e:#}"),
            }
        }

        Ok(())
    }
}
