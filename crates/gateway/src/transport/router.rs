// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Axum `Router` construction: the `/ws` upgrade route plus health and
//! metrics endpoints, matching the teacher's `build_router`/
//! `build_health_router` split (one router for traffic, a minimal one
//! for the health-only port).

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::transport::ws::ws_handler;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    active_sessions: usize,
}

async fn health(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        active_sessions: state.hub.count().await,
    })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let allowed = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect::<Vec<_>>();
        CorsLayer::new().allow_origin(allowed)
    }
}

/// Build the main traffic router: `/ws` upgrade plus a health endpoint.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build the health-only router bound to `--health-port`, reachable
/// even if the main traffic port is saturated.
pub fn build_health_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .with_state(state)
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
