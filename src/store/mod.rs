//! Storage seams for the coordinator.
//!
//! Admission into a device (the "at most one in-flight composite per device"
//! invariant) is enforced here, as a uniqueness predicate over execution rows
//! checked and set in a single transaction. The postgres implementation backs
//! that with partial unique indexes; the in-memory implementation with a
//! single mutex. Everything above this layer can assume [`Repository::try_admit`]
//! is atomic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Device, ExecutionRow, ExecutionStatus, Node, QueueEntry};

pub mod memory;
pub mod postgres;

/// Result of the single-transaction admission check.
#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    /// A `pending` execution row was created; the device is now held.
    Admitted { execution_id: i64 },
    /// Another master already holds the device.
    DeviceBusy,
    /// This (device, master) pair is already pending or running.
    DuplicateMaster,
}

/// Result of offering an entry to a device queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Offer {
    Accepted,
    /// The (device, master) pair is already waiting; offers are idempotent.
    AlreadyQueued,
    /// The device's queue is past its soft limit; the entry was refused, not
    /// dropped.
    Overloaded { size: u64 },
}

/// Everything the completion callback writes in one transaction.
#[derive(Clone, Debug)]
pub struct Finalization {
    pub execution_id: i64,
    pub master_id: i64,
    pub status: ExecutionStatus,
    pub summary: serde_json::Value,
    pub finished_at: DateTime<Utc>,
    /// The master's new `next_run_at`. `None` leaves the master untouched so
    /// the next tick re-schedules it (shutdown interruptions).
    pub next_run_at: Option<DateTime<Utc>>,
    /// Open the gates of masters that fire on this master's success.
    pub clear_gates: bool,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Enabled masters on enabled devices whose `next_run_at` has passed,
    /// gated masters excluded, joined with their device snapshots.
    async fn load_ready_masters(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<(Device, Node)>>;

    /// Set `next_run_at = now + interval` for enabled masters missing one.
    /// Returns the repaired (master id, next_run_at) pairs.
    async fn repair_missing_next_runs(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(i64, DateTime<Utc>)>>;

    async fn load_followers(&self, master_id: i64) -> anyhow::Result<Vec<Node>>;

    /// A master node together with its device, regardless of schedule state.
    /// Used by the out-of-band run endpoint and orphan recovery.
    async fn load_master(&self, node_id: i64) -> anyhow::Result<Option<(Device, Node)>>;

    async fn get_node(&self, node_id: i64) -> anyhow::Result<Option<Node>>;

    async fn get_execution(&self, execution_id: i64) -> anyhow::Result<Option<ExecutionRow>>;

    /// True when any execution for the device is pending or running.
    async fn device_busy(&self, device_id: i64) -> anyhow::Result<bool>;

    /// True when this (device, master) pair is pending or running.
    async fn has_in_flight(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool>;

    /// The single-transaction admission decision: create a `pending` row iff
    /// the device is free and the pair is not already in flight.
    async fn try_admit(
        &self,
        device_id: i64,
        master_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Admission>;

    /// Transition `pending` -> `running` and record the worker identity.
    /// Returns false when the row is no longer pending (recovered or stale).
    async fn mark_running(
        &self,
        execution_id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Write the final status together with the master's schedule advance.
    /// Returns false when the row was already finalized; replays are no-ops.
    async fn finalize(&self, fin: Finalization) -> anyhow::Result<bool>;

    /// Record a follower run. Followers never touch `next_run_at`.
    async fn touch_follower(
        &self,
        node_id: i64,
        at: DateTime<Utc>,
        success: bool,
    ) -> anyhow::Result<()>;

    /// `pending` executions older than the given instant with no assigned
    /// worker.
    async fn find_orphaned(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<ExecutionRow>>;

    /// Rewrite a confirmed orphan to `interrupted`, freeing its device.
    /// Returns false when the row was picked up or finalized in the meantime.
    async fn interrupt_orphan(&self, execution_id: i64) -> anyhow::Result<bool>;

    /// Cheap liveness check for the health surface.
    async fn ping(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Idempotent on (device, master); refuses past the soft limit.
    async fn offer(&self, entry: QueueEntry) -> anyhow::Result<Offer>;

    /// Remove and return the best entry for the device, ordered by
    /// (priority desc, delay_score desc, enqueued_at asc).
    async fn poll(&self, device_id: i64) -> anyhow::Result<Option<QueueEntry>>;

    async fn peek(&self, device_id: i64) -> anyhow::Result<Option<QueueEntry>>;

    async fn remove(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool>;

    async fn contains(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool>;

    async fn size(&self, device_id: i64) -> anyhow::Result<u64>;

    async fn total_size(&self) -> anyhow::Result<u64>;

    /// Per-device sizes for the control surface; devices with empty queues
    /// are omitted.
    async fn sizes(&self) -> anyhow::Result<Vec<(i64, u64)>>;
}

/// A held advisory lock. Dropping a lease does not release it; the TTL does.
#[derive(Clone, Debug)]
pub struct Lease {
    pub key: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Short-TTL advisory locks shared across coordinator processes.
///
/// These serialize the dispatch decision per (device, master) and the
/// queue-drain step per device during rolling deploys. They are an
/// optimisation layer: correctness rests on [`Repository::try_admit`], so a
/// failed acquisition or release is always tolerable.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Lease>>;

    async fn release(&self, lease: Lease) -> anyhow::Result<()>;
}

/// Lock key for the dispatch decision on one (device, master) pair.
pub fn creation_lock_key(device_id: i64, master_id: i64) -> String {
    format!("create:{device_id}:{master_id}")
}

/// Lock key for the completion callback's drain step on one device.
pub fn drain_lock_key(device_id: i64) -> String {
    format!("drain:{device_id}")
}
