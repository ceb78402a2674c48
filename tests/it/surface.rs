use std::time::Duration;

use chrono::Utc;
use olt_poller::http::{serve_on, AppState};
use olt_poller::model::{ExecutionStatus, QueueEntry};
use olt_poller::store::QueueStore;

use crate::harness::{device, master, wait_until, Harness};

async fn spawn_surface(h: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(h.dispatcher.clone(), h.health.clone());
    let shutdown = h.shutdown.clone();

    tokio::spawn(async move {
        let _ = serve_on(listener, state, shutdown).await;
    });

    format!("http://{addr}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slots_and_stats_are_observable() {
    let h = Harness::with_defaults();
    let base = spawn_surface(&h).await;

    let slots: serde_json::Value = reqwest::get(format!("{base}/pollers"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(slots.as_array().unwrap().len(), 2);
    assert_eq!(slots[0]["state"], "free");

    let stats: serde_json::Value = reqwest::get(format!("{base}/pollers/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["busy"], 0);
    assert_eq!(stats["saturated"], false);

    let health = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(health.status(), 200);

    h.shutdown.raise();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_endpoint_reports_backlog_and_head() {
    let h = Harness::with_defaults();
    let base = spawn_surface(&h).await;

    for (master_id, priority) in [(10, 40), (11, 90)] {
        h.store
            .offer(QueueEntry {
                device_id: 1,
                master_id,
                priority,
                delay_score: 0,
                enqueued_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let queue: serde_json::Value = reqwest::get(format!("{base}/pollers/queue"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(queue["total"], 2);
    assert_eq!(queue["devices"][0]["device_id"], 1);
    assert_eq!(queue["devices"][0]["size"], 2);
    assert_eq!(queue["devices"][0]["head"]["master_id"], 11);

    h.shutdown.raise();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_band_run_reports_duplicate_suppression() {
    let h = Harness::with_defaults();
    let base = spawn_surface(&h).await;

    h.store.add_device(device(1));
    h.store.add_node(master(1, 1, 90, 60, 0));
    h.executor
        .script(1, ExecutionStatus::Success, Duration::from_millis(500));

    h.scheduler.tick().await.unwrap();
    wait_until(Duration::from_secs(5), || !h.store.executions().is_empty()).await;

    // The node is in flight; the out-of-band run must be refused without a
    // second execution row.
    let response = reqwest::Client::new()
        .post(format!("{base}/pollers/nodes/1/run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "duplicate_suppressed");

    assert_eq!(h.store.executions().len(), 1);
    assert_eq!(h.dispatcher.queue().total_size().await.unwrap(), 0);

    h.wait_idle().await;
    h.shutdown.raise();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_band_run_dispatches_an_idle_master() {
    let h = Harness::with_defaults();
    let base = spawn_surface(&h).await;

    h.store.add_device(device(1));
    // Scheduled far in the future; only the operator wants it now.
    h.store.add_node(master(1, 1, 90, 3600, 3000));

    let response = reqwest::Client::new()
        .post(format!("{base}/pollers/nodes/1/run"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "dispatched");

    h.wait_idle().await;
    assert_eq!(
        h.store.executions()[0].status,
        ExecutionStatus::Success
    );

    h.shutdown.raise();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_nodes_get_a_404() {
    let h = Harness::with_defaults();
    let base = spawn_surface(&h).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/pollers/nodes/999/run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    h.shutdown.raise();
}
