use std::cmp::Reverse;

use chrono::{DateTime, Utc};

/// A managed OLT.
///
/// Devices are owned by the inventory collaborators; the coordinator only
/// ever holds read-only snapshots and observes `enabled` transitions at each
/// tick.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub label: String,
    /// Wire address the probe engine should reach the device on.
    pub address: String,
    /// Opaque handle resolved to SNMP credentials by the probe engine.
    pub credential: String,
    pub enabled: bool,
    pub vendor: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "probe_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Walk the device and enumerate attached ONUs.
    Discovery,
    /// Collect attributes across the already-known ONUs.
    Get,
}

impl ProbeKind {
    pub fn default_priority(self) -> i32 {
        match self {
            ProbeKind::Discovery => 90,
            ProbeKind::Get => 40,
        }
    }
}

/// A unit of SNMP work bound to one device.
///
/// Masters carry their own schedule (`next_run_at`); followers are reached
/// only through their master and inherit its scheduling.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub kind: ProbeKind,
    /// Higher wins. A stable ordering key, not a preemption level.
    pub priority: i32,
    /// Seconds between runs. Must be at least 1.
    pub interval_secs: i64,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Null for masters; otherwise the id of the master this node follows.
    pub chain_master_id: Option<i64>,
    /// Position of a follower within its chain.
    pub chain_order: i32,
    /// When set, this master's schedule is gated on a success of the named
    /// master on the same device.
    pub fire_after: Option<i64>,
    /// True while the gate is armed; cleared by the gating master's next
    /// success.
    pub gate_closed: bool,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.chain_master_id.is_none()
    }

    /// Validate the fields the scheduler depends on. A node failing this is
    /// skipped for the tick, never mutated.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs < 1 {
            return Err(format!(
                "node {} has interval {}s, the minimum is 1s",
                self.id, self.interval_secs
            ));
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Interrupted
        )
    }
}

/// The durable record of one composite run.
#[derive(Clone, Debug, sqlx::FromRow, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: i64,
    pub device_id: i64,
    pub master_id: i64,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `<process-uuid>/<slot>` once a worker picks the execution up.
    pub worker: Option<String>,
    pub attempt: i32,
    pub summary: Option<serde_json::Value>,
}

/// A durable entry waiting for its device to free.
///
/// `delay_score` is frozen at enqueue time; the queue never re-ranks waiting
/// entries.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct QueueEntry {
    pub device_id: i64,
    pub master_id: i64,
    pub priority: i32,
    pub delay_score: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// The transient scheduling unit: one master plus its enabled followers in
/// chain order.
///
/// Assembled from persistence snapshots at tick time and discarded once the
/// completion callback has run; it owns nothing durable and carries only ids
/// into execution rows and queue entries.
#[derive(Clone, Debug)]
pub struct Composite {
    pub device: Device,
    pub master: Node,
    pub followers: Vec<Node>,
    /// True when the master's arrears exceed its own interval.
    pub delayed: bool,
    /// Seconds past `next_run_at` at assembly time. Used for ordering and
    /// telemetry only.
    pub delay_secs: i64,
}

impl Composite {
    pub fn assemble(
        device: Device,
        master: Node,
        mut followers: Vec<Node>,
        now: DateTime<Utc>,
    ) -> Self {
        followers.retain(|f| f.enabled);
        followers.sort_by_key(|f| (f.chain_order, f.id));

        let delay_secs = master
            .next_run_at
            .map(|at| (now - at).num_seconds().max(0))
            .unwrap_or(0);
        let delayed = delay_secs > master.interval_secs;

        Self {
            device,
            master,
            followers,
            delayed,
            delay_secs,
        }
    }

    /// The ready-set ordering key: delayed items first, then largest arrears,
    /// then priority, with the device id as the stable tiebreaker.
    ///
    /// Sort descending by this key to get execution order.
    pub fn ready_key(&self) -> (bool, i64, i32, Reverse<i64>) {
        (
            self.delayed,
            self.delay_secs,
            self.master.priority,
            Reverse(self.device.id),
        )
    }
}

/// Progress of one composite through its run, as shown by the pool's slot
/// table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositePhase {
    Created,
    RunningMaster,
    /// Index into the follower chain.
    RunningFollower(usize),
    Completed(ExecutionStatus),
}
