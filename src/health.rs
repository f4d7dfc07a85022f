// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Health Endpoints
//!
//! - `GET /` reports process liveness only. It answers `ok` whatever the broker
//!   connection looks like.
//! - `GET /ready` reports whether the watcher is currently consuming.

use crate::{configs::AppConfigs, watcher::WatcherState};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Body of `GET /`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Liveness {
    /// Always `ok` while the process serves requests
    pub status: &'static str,
    pub service: String,
    pub environment: String,
    /// RFC 3339 time of the response, millisecond precision
    pub timestamp: String,
}

/// Body of `GET /ready`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Readiness {
    /// `ready` while consuming, `unavailable` otherwise
    pub status: &'static str,
    pub state: WatcherState,
}

/// Shared state of the health handlers: service identity and a view on the
/// watcher's lifecycle.
pub struct HealthState {
    app: AppConfigs,
    watcher: watch::Receiver<WatcherState>,
}

impl HealthState {
    /// `watcher` usually comes from [`crate::watcher::WatcherService::subscribe`].
    pub fn new(app: AppConfigs, watcher: watch::Receiver<WatcherState>) -> Arc<Self> {
        Arc::new(HealthState { app, watcher })
    }
}

/// Routes `GET /` to [`liveness`] and `GET /ready` to [`readiness`].
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/ready", get(readiness))
        .with_state(state)
}

/// Liveness probe: answers `200 ok` whatever the broker connection looks like.
pub async fn liveness(State(state): State<Arc<HealthState>>) -> Json<Liveness> {
    Json(Liveness {
        status: "ok",
        service: state.app.name.clone(),
        environment: state.app.env.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Readiness probe: `200` while the watcher consumes, `503` in any other state.
pub async fn readiness(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Readiness>) {
    let current = *state.watcher.borrow();

    if current == WatcherState::Consuming {
        (
            StatusCode::OK,
            Json(Readiness {
                status: "ready",
                state: current,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Readiness {
                status: "unavailable",
                state: current,
            }),
        )
    }
}

/// Serves the health endpoints until `shutdown` is cancelled.
pub async fn serve(
    state: Arc<HealthState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|err| {
        error!(error = err.to_string(), port, "failure to bind health server");
        err
    })?;

    info!(port, "health server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
