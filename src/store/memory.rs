//! In-memory store implementations.
//!
//! A single mutex over all tables makes every operation atomic, which is what
//! the postgres implementation achieves with transactions and partial unique
//! indexes. Used by the test suite and by dry-run deployments without a
//! database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Admission, Finalization, Lease, LockManager, Offer, QueueStore, Repository};
use crate::event::{EventSink, StoredEvent};
use crate::model::{Device, ExecutionRow, ExecutionStatus, Node, QueueEntry};

#[derive(Default)]
struct Inner {
    devices: HashMap<i64, Device>,
    nodes: HashMap<i64, Node>,
    executions: HashMap<i64, ExecutionRow>,
    queues: HashMap<i64, Vec<QueueEntry>>,
    locks: HashMap<String, (Uuid, DateTime<Utc>)>,
    next_execution_id: i64,
}

impl Inner {
    fn in_flight(&self, device_id: i64) -> impl Iterator<Item = &ExecutionRow> {
        self.executions.values().filter(move |row| {
            row.device_id == device_id
                && matches!(
                    row.status,
                    ExecutionStatus::Pending | ExecutionStatus::Running
                )
        })
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    queue_soft_limit: u64,
}

impl MemoryStore {
    pub fn new(queue_soft_limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_execution_id: 1,
                ..Default::default()
            }),
            queue_soft_limit,
        }
    }

    pub fn add_device(&self, device: Device) {
        self.inner.lock().devices.insert(device.id, device);
    }

    pub fn add_node(&self, node: Node) {
        self.inner.lock().nodes.insert(node.id, node);
    }

    pub fn update_node(&self, node_id: i64, f: impl FnOnce(&mut Node)) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            f(node);
        }
    }

    pub fn node(&self, node_id: i64) -> Option<Node> {
        self.inner.lock().nodes.get(&node_id).cloned()
    }

    pub fn executions(&self) -> Vec<ExecutionRow> {
        let mut rows: Vec<_> = self.inner.lock().executions.values().cloned().collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// Backdate an execution's creation instant. Test hook for orphan
    /// recovery scenarios.
    pub fn backdate_execution(&self, execution_id: i64, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.executions.get_mut(&execution_id) {
            row.created_at = created_at;
        }
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn load_ready_masters(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<(Device, Node)>> {
        let inner = self.inner.lock();
        let mut ready = Vec::new();

        for node in inner.nodes.values() {
            if !node.is_master() || !node.enabled || node.gate_closed {
                continue;
            }
            let Some(next_run_at) = node.next_run_at else {
                continue;
            };
            if next_run_at > now {
                continue;
            }
            let Some(device) = inner.devices.get(&node.device_id) else {
                continue;
            };
            if !device.enabled {
                continue;
            }

            ready.push((device.clone(), node.clone()));
        }

        ready.sort_by_key(|(_, node)| node.id);
        Ok(ready)
    }

    async fn repair_missing_next_runs(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(i64, DateTime<Utc>)>> {
        let mut inner = self.inner.lock();
        let enabled_devices: Vec<i64> = inner
            .devices
            .values()
            .filter(|d| d.enabled)
            .map(|d| d.id)
            .collect();

        let mut repaired = Vec::new();
        for node in inner.nodes.values_mut() {
            if !node.is_master()
                || !node.enabled
                || node.next_run_at.is_some()
                || !enabled_devices.contains(&node.device_id)
            {
                continue;
            }

            let next = now + chrono::Duration::seconds(node.interval_secs);
            node.next_run_at = Some(next);
            repaired.push((node.id, next));
        }

        repaired.sort_by_key(|(id, _)| *id);
        Ok(repaired)
    }

    async fn load_followers(&self, master_id: i64) -> anyhow::Result<Vec<Node>> {
        let inner = self.inner.lock();
        let mut followers: Vec<_> = inner
            .nodes
            .values()
            .filter(|n| n.chain_master_id == Some(master_id))
            .cloned()
            .collect();

        followers.sort_by_key(|n| (n.chain_order, n.id));
        Ok(followers)
    }

    async fn load_master(&self, node_id: i64) -> anyhow::Result<Option<(Device, Node)>> {
        let inner = self.inner.lock();
        let Some(node) = inner.nodes.get(&node_id) else {
            return Ok(None);
        };
        if !node.is_master() {
            return Ok(None);
        }
        let Some(device) = inner.devices.get(&node.device_id) else {
            return Ok(None);
        };

        Ok(Some((device.clone(), node.clone())))
    }

    async fn get_node(&self, node_id: i64) -> anyhow::Result<Option<Node>> {
        Ok(self.inner.lock().nodes.get(&node_id).cloned())
    }

    async fn get_execution(&self, execution_id: i64) -> anyhow::Result<Option<ExecutionRow>> {
        Ok(self.inner.lock().executions.get(&execution_id).cloned())
    }

    async fn device_busy(&self, device_id: i64) -> anyhow::Result<bool> {
        Ok(self.inner.lock().in_flight(device_id).next().is_some())
    }

    async fn has_in_flight(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .inner
            .lock()
            .in_flight(device_id)
            .any(|row| row.master_id == master_id))
    }

    async fn try_admit(
        &self,
        device_id: i64,
        master_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Admission> {
        let mut inner = self.inner.lock();

        let mut busy = false;
        for row in inner.in_flight(device_id) {
            if row.master_id == master_id {
                return Ok(Admission::DuplicateMaster);
            }
            busy = true;
        }
        if busy {
            return Ok(Admission::DeviceBusy);
        }

        let id = inner.next_execution_id;
        inner.next_execution_id += 1;
        inner.executions.insert(
            id,
            ExecutionRow {
                id,
                device_id,
                master_id,
                status: ExecutionStatus::Pending,
                created_at: now,
                started_at: None,
                finished_at: None,
                worker: None,
                attempt: 1,
                summary: None,
            },
        );

        Ok(Admission::Admitted { execution_id: id })
    }

    async fn mark_running(
        &self,
        execution_id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        let Some(row) = inner.executions.get_mut(&execution_id) else {
            return Ok(false);
        };
        if row.status != ExecutionStatus::Pending {
            return Ok(false);
        }

        row.status = ExecutionStatus::Running;
        row.started_at = Some(now);
        row.worker = Some(worker.to_string());
        Ok(true)
    }

    async fn finalize(&self, fin: Finalization) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();

        let Some(row) = inner.executions.get_mut(&fin.execution_id) else {
            return Ok(false);
        };
        if row.status.is_final() {
            return Ok(false);
        }

        row.status = fin.status;
        row.finished_at = Some(fin.finished_at);
        row.summary = Some(fin.summary.clone());

        if let Some(next_run_at) = fin.next_run_at {
            if let Some(master) = inner.nodes.get_mut(&fin.master_id) {
                master.last_run_at = Some(fin.finished_at);
                master.next_run_at = Some(next_run_at);
                match fin.status {
                    ExecutionStatus::Success => master.last_success_at = Some(fin.finished_at),
                    _ => master.last_failure_at = Some(fin.finished_at),
                }
            }
        }

        if fin.clear_gates {
            for node in inner.nodes.values_mut() {
                if node.fire_after == Some(fin.master_id) {
                    node.gate_closed = false;
                }
            }
        }

        Ok(true)
    }

    async fn touch_follower(
        &self,
        node_id: i64,
        at: DateTime<Utc>,
        success: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.last_run_at = Some(at);
            if success {
                node.last_success_at = Some(at);
            } else {
                node.last_failure_at = Some(at);
            }
        }

        Ok(())
    }

    async fn find_orphaned(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<ExecutionRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .executions
            .values()
            .filter(|row| {
                row.status == ExecutionStatus::Pending
                    && row.worker.is_none()
                    && row.created_at < older_than
            })
            .cloned()
            .collect();

        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn interrupt_orphan(&self, execution_id: i64) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        let Some(row) = inner.executions.get_mut(&execution_id) else {
            return Ok(false);
        };
        if row.status != ExecutionStatus::Pending || row.worker.is_some() {
            return Ok(false);
        }

        row.status = ExecutionStatus::Interrupted;
        row.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn offer(&self, entry: QueueEntry) -> anyhow::Result<Offer> {
        let mut inner = self.inner.lock();
        let queue = inner.queues.entry(entry.device_id).or_default();

        if queue.iter().any(|e| e.master_id == entry.master_id) {
            return Ok(Offer::AlreadyQueued);
        }

        let size = queue.len() as u64;
        if size >= self.queue_soft_limit {
            return Ok(Offer::Overloaded { size });
        }

        queue.push(entry);
        Ok(Offer::Accepted)
    }

    async fn poll(&self, device_id: i64) -> anyhow::Result<Option<QueueEntry>> {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.queues.get_mut(&device_id) else {
            return Ok(None);
        };

        let best = queue
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| {
                (
                    e.priority,
                    e.delay_score,
                    std::cmp::Reverse(e.enqueued_at),
                )
            })
            .map(|(index, _)| index);

        Ok(best.map(|index| queue.remove(index)))
    }

    async fn peek(&self, device_id: i64) -> anyhow::Result<Option<QueueEntry>> {
        let inner = self.inner.lock();
        let Some(queue) = inner.queues.get(&device_id) else {
            return Ok(None);
        };

        Ok(queue
            .iter()
            .max_by_key(|e| {
                (
                    e.priority,
                    e.delay_score,
                    std::cmp::Reverse(e.enqueued_at),
                )
            })
            .cloned())
    }

    async fn remove(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.queues.get_mut(&device_id) else {
            return Ok(false);
        };

        let before = queue.len();
        queue.retain(|e| e.master_id != master_id);
        Ok(queue.len() != before)
    }

    async fn contains(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .queues
            .get(&device_id)
            .is_some_and(|q| q.iter().any(|e| e.master_id == master_id)))
    }

    async fn size(&self, device_id: i64) -> anyhow::Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.queues.get(&device_id).map_or(0, |q| q.len() as u64))
    }

    async fn total_size(&self) -> anyhow::Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.queues.values().map(|q| q.len() as u64).sum())
    }

    async fn sizes(&self) -> anyhow::Result<Vec<(i64, u64)>> {
        let inner = self.inner.lock();
        let mut sizes: Vec<_> = inner
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(device, q)| (*device, q.len() as u64))
            .collect();

        sizes.sort_by_key(|(device, _)| *device);
        Ok(sizes)
    }
}

#[async_trait]
impl LockManager for MemoryStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Lease>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        if let Some((_, expires_at)) = inner.locks.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5));
        inner.locks.insert(key.to_string(), (token, expires_at));

        Ok(Some(Lease {
            key: key.to_string(),
            token,
            expires_at,
        }))
    }

    async fn release(&self, lease: Lease) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some((token, _)) = inner.locks.get(&lease.key) {
            if *token == lease.token {
                inner.locks.remove(&lease.key);
            }
        }

        Ok(())
    }
}

/// Append-only event sink over a vector. Test observability.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, batch: &[StoredEvent]) -> anyhow::Result<()> {
        self.events.lock().extend_from_slice(batch);
        Ok(())
    }
}
