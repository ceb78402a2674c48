use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// The period of the scheduler tick.
    ///
    /// Each tick scans every enabled master node whose `next_run_at` has
    /// passed and submits the resulting composites to the dispatcher. One
    /// second is the contract the rest of the system is written against;
    /// tests shrink it.
    pub tick_period: Duration,

    /// Number of worker slots in the poller pool.
    ///
    /// Each slot runs at most one composite at a time. A pool size of zero is
    /// legal and means every submission lands in the device queues.
    pub pool_size: usize,

    /// Soft cap on the number of pending entries a single device queue may
    /// hold. Offers beyond the cap are refused and recorded, never silently
    /// dropped.
    pub queue_soft_limit: u64,

    /// Submissions for a master that ran more recently than this are refused.
    ///
    /// This protects against duplicated ticks after wall-clock adjustments;
    /// it is an event-based guard, not a rate limit.
    pub recent_run_guard: Duration,

    /// The period with which the delivery watchdog scans for executions that
    /// were admitted but never picked up by a worker.
    ///
    /// The actual scan periods are jittered downwards by up to 1/4 of the
    /// period to avoid thundering herds on the database server.
    pub watchdog_period: Duration,

    /// Age after which an unassigned `pending` execution is considered
    /// orphaned and eligible for recovery.
    pub orphan_age: Duration,

    /// TTL of the advisory lock held across a single dispatch decision for
    /// one (device, master) pair.
    pub creation_lock_ttl: Duration,

    /// TTL of the advisory lock held by the completion callback around the
    /// queue-drain step for one device.
    pub drain_lock_ttl: Duration,

    /// How long in-flight composites are given to finish once shutdown has
    /// been requested. Composites still running after this are finalized as
    /// interrupted and their masters are not advanced.
    pub shutdown_grace: Duration,

    /// Width of the sliding window over which the pool's busy percentage is
    /// computed.
    pub busy_window: Duration,

    /// Busy percentage above which the pool reports itself saturated.
    pub saturation_busy_pct: f64,

    /// The pool also reports saturated when the total queued entry count
    /// exceeds this multiple of the pool size.
    pub saturation_queue_factor: u64,

    /// Upper bound on one probe out-call, covering the SNMP walk or the
    /// full per-ONU fan-out on the probe engine's side.
    pub probe_timeout: Duration,

    /// Capacity of the event writer channel. `emit` never blocks; events
    /// beyond this backlog are counted and dropped from the durable log
    /// (they still reach the tracing output).
    pub event_buffer: usize,

    /// How many consecutive tick overruns are tolerated before the scheduler
    /// escalates to a warning.
    pub overrun_tolerance: u32,

    /// When set, events older than this horizon are deleted by a low-cadence
    /// sweep. `None` disables the sweep entirely.
    pub event_retention: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            pool_size: 10,
            queue_soft_limit: 100,
            recent_run_guard: Duration::from_secs(3),
            watchdog_period: Duration::from_secs(30),
            orphan_age: Duration::from_secs(300),
            creation_lock_ttl: Duration::from_secs(5),
            drain_lock_ttl: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(60),
            busy_window: Duration::from_secs(60),
            saturation_busy_pct: 75.0,
            saturation_queue_factor: 2,
            probe_timeout: Duration::from_secs(120),
            event_buffer: 1024,
            overrun_tolerance: 5,
            event_retention: None,
        }
    }
}
