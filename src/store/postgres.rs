//! Postgres-backed store implementations.
//!
//! Queries are runtime-checked so the crate builds without a database at
//! hand. Admission atomicity comes from the partial unique indexes over
//! `executions(device_id)` and `executions(device_id, master_id)` restricted
//! to in-flight statuses; the insert either lands or reports exactly which
//! invariant it would have broken.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Admission, Finalization, Lease, LockManager, Offer, QueueStore, Repository};
use crate::event::{EventSink, StoredEvent};
use crate::model::{Device, ExecutionRow, ExecutionStatus, Node, QueueEntry};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct PgStore {
    pool: PgPool,
    queue_soft_limit: u64,
}

impl PgStore {
    pub fn new(pool: PgPool, queue_soft_limit: u64) -> Self {
        Self {
            pool,
            queue_soft_limit,
        }
    }

    /// Apply any pending schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("failed to migrate the database")?;

        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_devices(&self, ids: &[i64]) -> anyhow::Result<HashMap<i64, Device>> {
        let devices: Vec<Device> =
            sqlx::query_as("SELECT * FROM devices WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;

        Ok(devices.into_iter().map(|d| (d.id, d)).collect())
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Repository for PgStore {
    async fn load_ready_masters(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<(Device, Node)>> {
        let nodes: Vec<Node> = sqlx::query_as(
            "SELECT n.*
               FROM nodes n
               JOIN devices d ON d.id = n.device_id
              WHERE n.chain_master_id IS NULL
                AND n.enabled
                AND NOT n.gate_closed
                AND n.next_run_at IS NOT NULL
                AND n.next_run_at <= $1
                AND d.enabled
              ORDER BY n.id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let device_ids: Vec<i64> = nodes.iter().map(|n| n.device_id).collect();
        let devices = self.load_devices(&device_ids).await?;

        Ok(nodes
            .into_iter()
            .filter_map(|node| {
                let device = devices.get(&node.device_id)?.clone();
                Some((device, node))
            })
            .collect())
    }

    async fn repair_missing_next_runs(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(i64, DateTime<Utc>)>> {
        let repaired: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
            "UPDATE nodes n
                SET next_run_at = $1 + make_interval(secs => n.interval_secs)
               FROM devices d
              WHERE d.id = n.device_id
                AND d.enabled
                AND n.enabled
                AND n.chain_master_id IS NULL
                AND n.next_run_at IS NULL
              RETURNING n.id, n.next_run_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(repaired)
    }

    async fn load_followers(&self, master_id: i64) -> anyhow::Result<Vec<Node>> {
        Ok(sqlx::query_as(
            "SELECT *
               FROM nodes
              WHERE chain_master_id = $1
              ORDER BY chain_order, id",
        )
        .bind(master_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn load_master(&self, node_id: i64) -> anyhow::Result<Option<(Device, Node)>> {
        let node: Option<Node> =
            sqlx::query_as("SELECT * FROM nodes WHERE id = $1 AND chain_master_id IS NULL")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(node) = node else {
            return Ok(None);
        };

        let device: Option<Device> = sqlx::query_as("SELECT * FROM devices WHERE id = $1")
            .bind(node.device_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(device.map(|device| (device, node)))
    }

    async fn get_node(&self, node_id: i64) -> anyhow::Result<Option<Node>> {
        Ok(sqlx::query_as("SELECT * FROM nodes WHERE id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_execution(&self, execution_id: i64) -> anyhow::Result<Option<ExecutionRow>> {
        Ok(sqlx::query_as("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn device_busy(&self, device_id: i64) -> anyhow::Result<bool> {
        let busy: Option<i64> = sqlx::query_scalar(
            "SELECT 1::bigint
               FROM executions
              WHERE device_id = $1
                AND status IN ('pending', 'running')
              LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(busy.is_some())
    }

    async fn has_in_flight(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1::bigint
               FROM executions
              WHERE device_id = $1
                AND master_id = $2
                AND status IN ('pending', 'running')
              LIMIT 1",
        )
        .bind(device_id)
        .bind(master_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn try_admit(
        &self,
        device_id: i64,
        master_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Admission> {
        if self.has_in_flight(device_id, master_id).await? {
            return Ok(Admission::DuplicateMaster);
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO executions (device_id, master_id, status, created_at)
             VALUES ($1, $2, 'pending', $3)
             RETURNING id",
        )
        .bind(device_id)
        .bind(master_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(execution_id) => Ok(Admission::Admitted { execution_id }),
            // One of the partial unique indexes fired: the device got taken
            // between the check above and the insert. Either way the refusal
            // is "device held".
            Err(e) if is_unique_violation(&e) => Ok(Admission::DeviceBusy),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_running(
        &self,
        execution_id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE executions
                SET status = 'running', started_at = $2, worker = $3
              WHERE id = $1 AND status = 'pending'",
        )
        .bind(execution_id)
        .bind(now)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finalize(&self, fin: Finalization) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let finalized = sqlx::query(
            "UPDATE executions
                SET status = $2, finished_at = $3, summary = $4
              WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(fin.execution_id)
        .bind(fin.status)
        .bind(fin.finished_at)
        .bind(&fin.summary)
        .execute(&mut *tx)
        .await?;

        if finalized.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(next_run_at) = fin.next_run_at {
            let succeeded = fin.status == ExecutionStatus::Success;
            sqlx::query(
                "UPDATE nodes
                    SET last_run_at = $2,
                        next_run_at = $3,
                        last_success_at = CASE WHEN $4 THEN $2 ELSE last_success_at END,
                        last_failure_at = CASE WHEN $4 THEN last_failure_at ELSE $2 END
                  WHERE id = $1",
            )
            .bind(fin.master_id)
            .bind(fin.finished_at)
            .bind(next_run_at)
            .bind(succeeded)
            .execute(&mut *tx)
            .await?;
        }

        if fin.clear_gates {
            sqlx::query("UPDATE nodes SET gate_closed = false WHERE fire_after = $1")
                .bind(fin.master_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn touch_follower(
        &self,
        node_id: i64,
        at: DateTime<Utc>,
        success: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE nodes
                SET last_run_at = $2,
                    last_success_at = CASE WHEN $3 THEN $2 ELSE last_success_at END,
                    last_failure_at = CASE WHEN $3 THEN last_failure_at ELSE $2 END
              WHERE id = $1",
        )
        .bind(node_id)
        .bind(at)
        .bind(success)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_orphaned(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<ExecutionRow>> {
        Ok(sqlx::query_as(
            "SELECT *
               FROM executions
              WHERE status = 'pending'
                AND worker IS NULL
                AND created_at < $1
              ORDER BY id",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn interrupt_orphan(&self, execution_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE executions
                SET status = 'interrupted', finished_at = now()
              WHERE id = $1 AND status = 'pending' AND worker IS NULL",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn offer(&self, entry: QueueEntry) -> anyhow::Result<Offer> {
        let size = self.size(entry.device_id).await?;
        if size >= self.queue_soft_limit {
            return Ok(Offer::Overloaded { size });
        }

        let result = sqlx::query(
            "INSERT INTO device_queue_entries
                 (device_id, master_id, priority, delay_score, enqueued_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (device_id, master_id) DO NOTHING",
        )
        .bind(entry.device_id)
        .bind(entry.master_id)
        .bind(entry.priority)
        .bind(entry.delay_score)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(Offer::AlreadyQueued)
        } else {
            Ok(Offer::Accepted)
        }
    }

    async fn poll(&self, device_id: i64) -> anyhow::Result<Option<QueueEntry>> {
        Ok(sqlx::query_as(
            "DELETE FROM device_queue_entries
              WHERE (device_id, master_id) IN (
                    SELECT device_id, master_id
                      FROM device_queue_entries
                     WHERE device_id = $1
                     ORDER BY priority DESC, delay_score DESC, enqueued_at ASC
                     LIMIT 1
                       FOR UPDATE SKIP LOCKED
              )
              RETURNING *",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn peek(&self, device_id: i64) -> anyhow::Result<Option<QueueEntry>> {
        Ok(sqlx::query_as(
            "SELECT *
               FROM device_queue_entries
              WHERE device_id = $1
              ORDER BY priority DESC, delay_score DESC, enqueued_at ASC
              LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn remove(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM device_queue_entries
              WHERE device_id = $1 AND master_id = $2",
        )
        .bind(device_id)
        .bind(master_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn contains(&self, device_id: i64, master_id: i64) -> anyhow::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1::bigint
               FROM device_queue_entries
              WHERE device_id = $1 AND master_id = $2",
        )
        .bind(device_id)
        .bind(master_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn size(&self, device_id: i64) -> anyhow::Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM device_queue_entries WHERE device_id = $1")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }

    async fn total_size(&self) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM device_queue_entries")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn sizes(&self) -> anyhow::Result<Vec<(i64, u64)>> {
        let sizes: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT device_id, count(*)
               FROM device_queue_entries
              GROUP BY device_id
              ORDER BY device_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(sizes.into_iter().map(|(d, n)| (d, n as u64)).collect())
    }
}

#[async_trait]
impl LockManager for PgStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Lease>> {
        let token = Uuid::new_v4();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5));

        let acquired: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO advisory_locks (key, token, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
              WHERE advisory_locks.expires_at <= now()
             RETURNING token",
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.map(|token| Lease {
            key: key.to_string(),
            token,
            expires_at,
        }))
    }

    async fn release(&self, lease: Lease) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM advisory_locks WHERE key = $1 AND token = $2")
            .bind(&lease.key)
            .bind(lease.token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Append-only sink over the `poller_events` table.
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn append(&self, batch: &[StoredEvent]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for event in batch {
            sqlx::query(
                "INSERT INTO poller_events (at, kind, device_id, master_id, payload)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.at)
            .bind(event.kind)
            .bind(event.device_id)
            .bind(event.master_id)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM poller_events WHERE at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
