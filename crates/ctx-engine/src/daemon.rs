use anyhow::{bail, Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use ctx_core::memory_contracts::DegradationLevel;
use ctx_mind::{HealthSnapshot, PipelineScheduler, TickOutcome, TickReport};
use ctx_storage::DataDirLock;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub fn health_snapshot(scheduler: &PipelineScheduler) -> HealthSnapshot {
    let hot_source = scheduler.store().hot_source();
    scheduler.gateway().monitor().snapshot(hot_source, Utc::now())
}

fn health_status(level: DegradationLevel) -> StatusCode {
    match level {
        DegradationLevel::Offline => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

async fn health_handler(State(scheduler): State<Arc<PipelineScheduler>>) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || health_snapshot(&scheduler)).await {
        Ok(snapshot) => (health_status(snapshot.level), Json(snapshot)).into_response(),
        Err(err) => {
            error!(event = "health_snapshot_failed", error = %err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves `/health` and drives the scheduler until ctrl-c. The data
/// directory lock is held for the whole run.
pub async fn run(scheduler: PipelineScheduler, health_addr: &str, lock: DataDirLock) -> Result<()> {
    let addr: SocketAddr = health_addr
        .parse()
        .with_context(|| format!("invalid health address {health_addr}"))?;
    if !addr.ip().is_loopback() {
        bail!("health address {addr} is not a loopback address");
    }

    let period = Duration::from_millis(scheduler.config().tick_period_ms.max(1));
    let scheduler = Arc::new(scheduler);
    let (stop_tx, stop_rx) = watch::channel(false);
    let ticker = tokio::spawn(tick_loop(scheduler.clone(), period, stop_rx));

    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(scheduler);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        event = "engine_start",
        addr = %addr,
        tick_period_ms = period.as_millis() as u64,
        lock = %lock.path().display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = stop_tx.send(true);
    if let Err(err) = ticker.await {
        warn!(event = "tick_loop_join_failed", error = %err);
    }
    info!(event = "engine_stop");
    served.context("health server failed")
}

async fn tick_loop(
    scheduler: Arc<PipelineScheduler>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        let worker = scheduler.clone();
        match tokio::task::spawn_blocking(move || worker.tick(Utc::now())).await {
            Ok(Ok(report)) => log_tick(&report),
            Ok(Err(err)) => error!(event = "tick_failed", error = %err),
            Err(err) => error!(event = "tick_panicked", error = %err),
        }
    }
}

fn log_tick(report: &TickReport) {
    match &report.outcome {
        TickOutcome::Idle | TickOutcome::Busy => debug!(
            event = "tick",
            outcome = ?report.outcome,
            outbox_pending = report.outbox.pending
        ),
        outcome => info!(
            event = "tick",
            outcome = ?outcome,
            session_id = report.session_id.as_deref().unwrap_or(""),
            revision = ?report.revision,
            outbox_pending = report.outbox.pending
        ),
    }
}
