//! Scheduler and poller coordinator for a fleet-wide OLT/ONU SNMP polling
//! service.
//!
//! The coordinator decides which probe runs when, on which device, under
//! what concurrency limits, and routes results back when a probe completes:
//!
//! * a 1 Hz [`scheduler`] tick that scans ready master nodes and assembles
//!   probe chains into composites,
//! * a [`dispatch`]er enforcing at most one in-flight composite per device,
//! * a fixed-size [`pool`] of worker slots executing composites in parallel
//!   across devices,
//! * a durable per-device pending queue drained the moment a device frees,
//! * a delivery [`watchdog`] recovering admitted work that never reached a
//!   worker,
//! * an append-only [`event`] log behind every decision.
//!
//! SNMP wire I/O, index formulas, inventory and the admin surfaces live in
//! collaborating services; the seams are the [`probe::ProbeExecutor`],
//! [`store::Repository`], [`store::QueueStore`], [`store::LockManager`] and
//! [`event::EventSink`] traits.

#[macro_use]
extern crate serde;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod flag;
pub mod http;
pub mod model;
pub mod pool;
pub mod probe;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod watchdog;

pub use self::config::Config;
pub use self::error::FatalError;
pub use self::runtime::{Runtime, RuntimeBuilder, RuntimeHandle};
