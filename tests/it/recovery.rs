use std::time::Duration;

use chrono::Utc;
use olt_poller::model::{ExecutionStatus, QueueEntry};
use olt_poller::store::{Admission, QueueStore, Repository};

use crate::harness::{device, master, test_config, wait_until, Harness};

#[tokio::test]
async fn orphaned_pending_execution_is_recovered() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, -400));

    // Admitted but never picked up: the process died between the insert and
    // the slot spawn.
    let Admission::Admitted { execution_id } =
        h.store.try_admit(1, 1, Utc::now()).await.unwrap()
    else {
        panic!("admission refused");
    };
    h.store
        .backdate_execution(execution_id, Utc::now() - chrono::Duration::seconds(400));

    let recovered = h.watchdog.sweep().await.unwrap();
    assert_eq!(recovered, 1);
    h.wait_for_event("ORPHAN_RECOVERED").await;

    let rows = h.store.executions();
    assert_eq!(rows[0].status, ExecutionStatus::Interrupted);

    // The device freed up and the composite went straight back through the
    // dispatcher.
    wait_until(Duration::from_secs(5), || h.store.executions().len() == 2).await;
    h.wait_idle().await;
    assert_eq!(
        h.store.executions()[1].status,
        ExecutionStatus::Success
    );
}

#[tokio::test]
async fn fresh_pending_executions_are_left_alone() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, 0));

    let Admission::Admitted { .. } = h.store.try_admit(1, 1, Utc::now()).await.unwrap() else {
        panic!("admission refused");
    };

    assert_eq!(h.watchdog.sweep().await.unwrap(), 0);
    assert_eq!(
        h.store.executions()[0].status,
        ExecutionStatus::Pending
    );
}

#[tokio::test]
async fn sweep_waits_while_the_pool_is_saturated() {
    let h = Harness::with_defaults();
    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, -400));

    let Admission::Admitted { execution_id } =
        h.store.try_admit(1, 1, Utc::now()).await.unwrap()
    else {
        panic!("admission refused");
    };
    h.store
        .backdate_execution(execution_id, Utc::now() - chrono::Duration::seconds(400));

    // Enough queued work to trip the saturation heuristic (pool size 2,
    // factor 2).
    for master_id in 100..105 {
        h.store
            .offer(QueueEntry {
                device_id: 9,
                master_id,
                priority: 40,
                delay_score: 0,
                enqueued_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    assert_eq!(h.watchdog.sweep().await.unwrap(), 0);
    assert_eq!(
        h.store.executions()[0].status,
        ExecutionStatus::Pending
    );
}

#[tokio::test]
async fn shutdown_interrupts_without_advancing_the_master() {
    let mut config = test_config();
    config.shutdown_grace = Duration::from_millis(100);
    let h = Harness::new(config);

    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, 0));
    h.executor
        .script(1, ExecutionStatus::Success, Duration::from_secs(30));

    let schedule_before = h.store.node(1).unwrap().next_run_at;

    h.scheduler.tick().await.unwrap();
    wait_until(Duration::from_secs(5), || {
        h.store
            .executions()
            .first()
            .is_some_and(|row| row.status == ExecutionStatus::Running)
    })
    .await;

    h.shutdown.raise();
    let (_, interrupted) = h.dispatcher.pool().drain().await;
    assert!(interrupted >= 1);

    wait_until(Duration::from_secs(5), || {
        h.store
            .executions()
            .iter()
            .all(|row| row.status == ExecutionStatus::Interrupted)
    })
    .await;

    // The master was not advanced, so the next tick re-schedules it.
    let node = h.store.node(1).unwrap();
    assert_eq!(node.next_run_at, schedule_before);
    assert_eq!(node.last_run_at, None);
}

#[tokio::test]
async fn pool_invariants_hold_under_load() {
    let mut config = test_config();
    config.pool_size = 2;
    let h = Harness::new(config);

    for d in 1..=4 {
        h.store.add_device(device(d));
        for k in 0..2 {
            h.store.add_node(master(d * 10 + k, d, 40 + k as i32, 60, 0));
        }
    }

    for _ in 0..100 {
        h.scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rows = h.store.executions();
        if rows.len() == 8 && rows.iter().all(|r| r.status.is_final()) {
            break;
        }
    }

    let rows = h.store.executions();
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.status == ExecutionStatus::Success));

    // Never more in flight than the pool has slots, never two probes on one
    // device at once.
    assert!(h.executor.max_concurrency() <= 2);
    assert!(!h.executor.device_overlap());
    assert_eq!(h.dispatcher.queue().total_size().await.unwrap(), 0);

    // Each master ran exactly once.
    for d in 1..=4i64 {
        for k in 0..2i64 {
            assert_eq!(h.executor.run_count(d * 10 + k), 1);
        }
    }
}
