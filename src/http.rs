//! The read-mostly control surface.
//!
//! Operators (and the admin UI) observe the pool and queues here; the only
//! write is the out-of-band run endpoint, which goes through the same
//! dispatcher as scheduled work and is subject to every invariant.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::model::{Composite, QueueEntry};
use crate::pool::{PoolStats, SlotView};
use crate::scheduler::TickHealth;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    health: TickHealth,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, health: TickHealth) -> Self {
        Self { dispatcher, health }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pollers", get(list_slots))
        .route("/pollers/queue", get(queue_overview))
        .route("/pollers/stats", get(pool_stats))
        .route("/pollers/nodes/:id/run", post(run_node))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: ShutdownFlag,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, state, shutdown).await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: ShutdownFlag,
) -> anyhow::Result<()> {
    let _guard = ShutdownGuard::new(&shutdown);
    tracing::info!("control surface listening on {}", listener.local_addr()?);

    let wait = {
        let shutdown = shutdown.clone();
        async move { shutdown.wait().await }
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait)
        .await?;

    Ok(())
}

type HandlerError = (StatusCode, String);

fn internal(e: anyhow::Error) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
}

async fn list_slots(State(state): State<AppState>) -> Json<Vec<SlotView>> {
    Json(state.dispatcher.pool().slot_views())
}

#[derive(Serialize)]
struct DeviceQueueView {
    device_id: i64,
    size: u64,
    head: Option<QueueEntry>,
}

#[derive(Serialize)]
struct QueueOverview {
    total: u64,
    devices: Vec<DeviceQueueView>,
}

async fn queue_overview(
    State(state): State<AppState>,
) -> Result<Json<QueueOverview>, HandlerError> {
    let queue = state.dispatcher.queue();
    let total = queue.total_size().await.map_err(internal)?;

    let mut devices = Vec::new();
    for (device_id, size) in queue.sizes().await.map_err(internal)? {
        let head = queue.peek(device_id).await.map_err(internal)?;
        devices.push(DeviceQueueView {
            device_id,
            size,
            head,
        });
    }

    Ok(Json(QueueOverview { total, devices }))
}

async fn pool_stats(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.dispatcher.pool().stats().await)
}

async fn run_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DispatchOutcome>, HandlerError> {
    let repo = state.dispatcher.repo();

    let Some((device, master)) = repo.load_master(id).await.map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("no master node with id {id}")));
    };

    if !device.enabled || !master.enabled {
        return Err((
            StatusCode::CONFLICT,
            format!("node {id} or its device is disabled"),
        ));
    }

    let followers = repo.load_followers(master.id).await.map_err(internal)?;
    let composite = Composite::assemble(device, master, followers, Utc::now());

    let outcome = state
        .dispatcher
        .submit(composite)
        .await
        .map_err(internal)?;

    Ok(Json(outcome))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    persistence: &'static str,
    tick_age_ms: Option<u64>,
    tick_failures: u32,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    let persistence_ok = state.dispatcher.repo().ping().await.is_ok();
    let tick_age = state.health.last_ok_age();
    let tick_failures = state.health.consecutive_failures();

    // Three failed ticks in a row flips the health check; transient
    // persistence errors within a single tick do not.
    let healthy = persistence_ok && tick_failures < 3;

    let health = Health {
        status: if healthy { "ok" } else { "degraded" },
        persistence: if persistence_ok { "ok" } else { "unreachable" },
        tick_age_ms: tick_age.map(|age| age.as_millis() as u64),
        tick_failures,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(health))
}
