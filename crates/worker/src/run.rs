// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Process wiring: connect to collaborators, spawn the chat-worker
//! pipeline and the read-receipt pool, run until shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::GroupCache;
use crate::chat_worker::ChatWorker;
use crate::config::Config;
use crate::receipts::ReceiptEngine;
use crate::store::Store;

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let shutdown = CancellationToken::new();

    let nats = async_nats::connect(&config.nats_url).await?;
    let store = Store::connect(&config.database_url).await?;
    let cache = GroupCache::connect(&config.redis_url).await?;

    if let Some(metrics_port) = config.metrics_port {
        let addr = format!("{}:{}", config.host, metrics_port).parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!("metrics listening on {addr}");
    }

    let worker = Arc::new(ChatWorker::new(
        nats.clone(),
        store.clone(),
        cache,
        config.prefetch,
        config.max_redelivery,
    ));
    let sd = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.run(sd).await {
            error!("chat worker stopped: {e:#}");
        }
    });

    let batch_window = Duration::from_millis(config.receipt_batch_ms);
    for i in 0..config.receipt_workers {
        let engine = Arc::new(ReceiptEngine::new(nats.clone(), store.clone(), batch_window));
        let sd = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(sd).await {
                error!(worker = i, "read-receipt worker stopped: {e:#}");
            }
        });
    }

    if let Some(health_port) = config.health_port {
        let addr = format!("{}:{}", config.host, health_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("health probe listening on {addr}");
        let router: Router = Router::new().route("/api/v1/health", get(health));
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(sd.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!("health server error: {e}");
            }
        });
    }

    spawn_signal_handler(shutdown.clone());

    let drain_secs = config.drain_secs;
    shutdown.cancelled().await;
    info!("shutdown signal received, draining for up to {drain_secs}s");
    tokio::time::sleep(Duration::from_secs(drain_secs)).await;
    Ok(())
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGTERM"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGINT"),
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGTERM again, forcing exit"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGINT again, forcing exit"),
        }
        std::process::exit(130);
    });
}
