//! Health HTTP surface (SPEC_FULL.md §4.15): `GET /health` reports
//! per-adapter status plus bus/aggregator counters; `GET /healthz` is a
//! plain liveness probe. A small `axum` server, following the teacher's
//! pattern of one spawned task per subsystem joined in `main`'s top-level
//! `tokio::select!`.

use crate::adapter::{Adapter, HealthStatus};
use crate::bus::BusStats;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
struct AdapterHealthView {
    name: String,
    status: &'static str,
    message: String,
    last_successful_read: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct BusView {
    queue_depth: u64,
    dropped: u64,
}

#[derive(Serialize)]
struct HealthView {
    adapters: Vec<AdapterHealthView>,
    bus: BusView,
}

fn status_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Unknown => "unknown",
    }
}

pub struct HealthState {
    pub adapters: Vec<Arc<dyn Adapter>>,
    pub bus_stats: Arc<BusStats>,
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<Arc<HealthState>>,
) -> Json<HealthView> {
    let mut adapters = Vec::with_capacity(state.adapters.len());
    for adapter in &state.adapters {
        let health = adapter.health().await;
        adapters.push(AdapterHealthView {
            name: adapter.name().to_string(),
            status: status_label(health.status),
            message: health.message,
            last_successful_read: health.last_successful_read,
        });
    }

    let published = state.bus_stats.published.load(Ordering::Relaxed);
    let dispatched = state.bus_stats.dispatched.load(Ordering::Relaxed);
    let dropped = state.bus_stats.dropped_backpressure.load(Ordering::Relaxed);

    Json(HealthView {
        adapters,
        bus: BusView {
            queue_depth: published.saturating_sub(dispatched),
            dropped,
        },
    })
}

async fn healthz_handler() -> &'static str {
    "ok"
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: Arc<HealthState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "health server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
