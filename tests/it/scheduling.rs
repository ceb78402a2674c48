use std::time::Duration;

use chrono::Utc;
use olt_poller::dispatch::DispatchOutcome;
use olt_poller::model::{Composite, ExecutionStatus};
use olt_poller::store::QueueStore;

use crate::harness::{device, master, test_config, wait_until, Harness};

#[tokio::test]
async fn happy_path_reschedules_on_completion() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, 0));

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.ready, 1);
    assert_eq!(summary.dispatched, 1);

    h.wait_idle().await;

    let rows = h.store.executions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Success);

    let finished_at = rows[0].finished_at.unwrap();
    let node = h.store.node(1).unwrap();
    assert_eq!(node.last_run_at, Some(finished_at));
    assert_eq!(node.last_success_at, Some(finished_at));
    assert_eq!(
        node.next_run_at,
        Some(finished_at + chrono::Duration::seconds(60))
    );

    // Not ready again until the interval elapses.
    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.ready, 0);

    // Force the next cycle and check the schedule only moves forward.
    let first_next_run = node.next_run_at.unwrap();
    h.store
        .update_node(1, |n| n.next_run_at = Some(Utc::now() - chrono::Duration::seconds(4)));
    h.store
        .update_node(1, |n| n.last_run_at = Some(Utc::now() - chrono::Duration::seconds(4)));

    h.scheduler.tick().await.unwrap();
    h.wait_idle().await;

    let rows = h.store.executions();
    assert_eq!(rows.len(), 2);
    let node = h.store.node(1).unwrap();
    assert!(node.next_run_at.unwrap() > first_next_run);
}

#[tokio::test]
async fn busy_device_serializes_and_drains_immediately() {
    let mut config = test_config();
    config.pool_size = 5;
    let h = Harness::new(config);

    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 30, 0));
    h.store.add_node(master(2, 1, 40, 30, 0));
    h.executor
        .script(1, ExecutionStatus::Success, Duration::from_millis(50));
    h.executor
        .script(2, ExecutionStatus::Success, Duration::from_millis(20));

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.ready, 2);
    // Only the high-priority master got the device; the other waits.
    assert_eq!(summary.dispatched, 1);
    h.wait_for_event("QUEUED").await;

    // The completion callback drains the queue without another tick.
    h.wait_idle().await;
    wait_until(Duration::from_secs(5), || h.store.executions().len() == 2).await;
    wait_until(Duration::from_secs(5), || {
        h.store.executions().iter().all(|r| r.status.is_final())
    })
    .await;

    assert_eq!(h.executor.runs(), vec![1, 2]);
    assert!(!h.executor.device_overlap());
    assert_eq!(h.dispatcher.queue().total_size().await.unwrap(), 0);
}

#[tokio::test]
async fn delayed_composite_outranks_priority() {
    let mut config = test_config();
    config.pool_size = 1;
    let h = Harness::new(config);

    h.store.add_device(device(1));
    h.store.add_device(device(2));
    // 300s in arrears on a 60s interval: delayed, despite the low priority.
    h.store.add_node(master(10, 1, 40, 60, -300));
    h.store.add_node(master(20, 2, 90, 60, 0));

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.ready, 2);
    assert_eq!(summary.dispatched, 1);

    wait_until(Duration::from_secs(5), || !h.executor.runs().is_empty()).await;
    assert_eq!(h.executor.runs()[0], 10);

    h.wait_idle().await;
    h.scheduler.tick().await.unwrap();
    h.wait_idle().await;

    assert_eq!(h.executor.runs(), vec![10, 20]);
}

#[tokio::test]
async fn ready_set_orders_by_delay_priority_then_device() {
    let mut config = test_config();
    config.pool_size = 3;
    let h = Harness::new(config);

    h.store.add_device(device(3));
    h.store.add_device(device(5));
    h.store.add_device(device(9));
    h.store.add_node(master(10, 9, 40, 60, -200)); // delayed
    h.store.add_node(master(20, 5, 90, 60, 0));
    h.store.add_node(master(30, 3, 90, 60, 0));

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.dispatched, 3);
    h.wait_idle().await;

    // Delayed first, then equal priorities broken by ascending device id.
    assert_eq!(h.executor.runs(), vec![10, 30, 20]);
}

#[tokio::test]
async fn recent_run_guard_refuses_resubmission() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    let mut m = master(1, 1, 90, 60, 0);
    m.last_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    h.store.add_node(m);

    h.scheduler.tick().await.unwrap();
    h.wait_for_event("TOO_SOON").await;

    assert!(h.store.executions().is_empty());
}

#[tokio::test]
async fn one_second_intervals_are_not_starved_by_the_guard() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    let mut m = master(1, 1, 90, 1, 0);
    m.last_run_at = Some(Utc::now() - chrono::Duration::seconds(2));
    h.store.add_node(m);

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.dispatched, 1);
}

#[tokio::test]
async fn missing_next_run_is_repaired_not_dispatched() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, 0));
    h.store.update_node(1, |n| n.next_run_at = None);

    let before = Utc::now();
    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.repaired, 1);
    assert_eq!(summary.ready, 0);
    h.wait_for_event("NEXT_RUN_INITIALIZED").await;

    let node = h.store.node(1).unwrap();
    let next_run_at = node.next_run_at.expect("schedule repaired");
    assert!(next_run_at >= before + chrono::Duration::seconds(60));
    assert!(h.store.executions().is_empty());
}

#[tokio::test]
async fn masters_on_disabled_devices_are_skipped() {
    let h = Harness::with_defaults();
    let mut d = device(1);
    d.enabled = false;
    h.store.add_device(d);
    h.store.add_node(master(1, 1, 90, 60, 0));

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.ready, 0);
    assert!(h.store.executions().is_empty());
}

#[tokio::test]
async fn pool_of_zero_queues_everything() {
    let mut config = test_config();
    config.pool_size = 0;
    let h = Harness::new(config);

    h.store.add_device(device(1));
    h.store.add_device(device(2));
    h.store.add_node(master(1, 1, 90, 60, 0));
    h.store.add_node(master(2, 2, 90, 60, 0));

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.ready, 2);
    assert_eq!(summary.dispatched, 0);

    assert!(h.store.executions().is_empty());
    assert_eq!(h.dispatcher.queue().total_size().await.unwrap(), 2);

    let stats = h.stats().await;
    assert_eq!(stats.total, 0);
    assert_eq!(stats.busy_pct, 0.0);
    assert!(stats.saturated);
}

#[tokio::test]
async fn offers_past_the_soft_limit_are_refused_with_overload() {
    let mut config = test_config();
    config.pool_size = 1;
    config.queue_soft_limit = 2;
    let h = Harness::new(config);

    h.store.add_device(device(1));
    for id in 0..4 {
        h.store.add_node(master(id, 1, 90 - id as i32, 60, 0));
    }
    // Pin the device with a slow probe so everything else has to queue.
    h.executor
        .script(0, ExecutionStatus::Success, Duration::from_millis(300));

    let submit = |id: i64| {
        let composite = Composite::assemble(
            device(1),
            h.store.node(id).unwrap(),
            vec![],
            Utc::now(),
        );
        let dispatcher = h.dispatcher.clone();
        async move { dispatcher.submit(composite).await.unwrap() }
    };

    assert!(matches!(submit(0).await, DispatchOutcome::Dispatched { .. }));
    assert_eq!(submit(1).await, DispatchOutcome::Queued);
    assert_eq!(submit(2).await, DispatchOutcome::Queued);
    assert_eq!(submit(3).await, DispatchOutcome::Overloaded);

    h.wait_for_event("OVERLOAD").await;
    assert_eq!(h.dispatcher.queue().size(1).await.unwrap(), 2);

    h.wait_idle().await;
}

#[tokio::test]
async fn in_flight_resubmission_is_a_no_op() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, 0));
    h.executor
        .script(1, ExecutionStatus::Success, Duration::from_millis(200));

    h.scheduler.tick().await.unwrap();
    wait_until(Duration::from_secs(5), || !h.store.executions().is_empty()).await;

    let composite = Composite::assemble(device(1), h.store.node(1).unwrap(), vec![], Utc::now());
    let outcome = h.dispatcher.submit(composite).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::DuplicateSuppressed);

    assert_eq!(h.store.executions().len(), 1);
    assert_eq!(h.dispatcher.queue().total_size().await.unwrap(), 0);

    h.wait_idle().await;
}
