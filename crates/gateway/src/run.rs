// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Process wiring: connect to collaborators, assemble `AppState`, bind
//! listeners, and run until a shutdown signal (§5, teacher's `run.rs`
//! signal-handling/server-spawn shape).

use std::sync::Arc;

use async_nats::jetstream::{self, stream::Config as StreamConfig};
use fabric_core::subjects::{CHAT_STREAM_NAME, CHAT_SUBJECT_FILTER};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::delivery::DeliveryRouter;
use crate::hub::Hub;
use crate::ingress::IngressPublisher;
use crate::presence::{PresencePublisher, PresenceRouter};
use crate::ratelimit::RateLimiter;
use crate::registry::CacheClient;
use crate::state::AppState;
use crate::store::Store;
use crate::transport::auth::JwtVerifier;
use crate::transport::router::{build_health_router, build_router};

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let shutdown = CancellationToken::new();

    let nats = async_nats::connect(&config.nats_url).await?;
    ensure_chat_stream(&nats).await?;

    let cache = CacheClient::connect(&config.redis_url).await?;
    let store = Store::connect(&config.database_url).await?;
    let jwt_pem = std::fs::read(&config.jwt_public_key)?;
    let jwt = JwtVerifier::from_pem(&jwt_pem)?;

    let hub = Hub::new().into();
    let delivery = DeliveryRouter::new(nats.clone(), Arc::clone(&hub));
    let ingress = IngressPublisher::new(
        nats.clone(),
        std::time::Duration::from_millis(config.publish_timeout_ms),
    );
    let presence = PresencePublisher::new(
        nats.clone(),
        cache.clone(),
        std::time::Duration::from_secs(config.conn_ttl_secs),
    );
    let rate_limiter = Arc::new(RateLimiter::new(config.upgrade_rate_per_min));

    spawn_presence_router(nats.clone(), Arc::clone(&hub), shutdown.clone());

    if let Some(metrics_port) = config.metrics_port {
        let addr = format!("{}:{}", config.host, metrics_port).parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!("metrics listening on {addr}");
    }

    let host = config.host.clone();
    let port = config.port;
    let health_port = config.health_port;
    let drain_secs = config.drain_secs;

    let state = Arc::new(AppState {
        config,
        hub,
        cache,
        store,
        ingress,
        delivery,
        presence,
        rate_limiter: Arc::clone(&rate_limiter),
        jwt,
        nats,
        shutdown: shutdown.clone(),
    });

    spawn_rate_limiter_sweep(Arc::clone(&rate_limiter), shutdown.clone());

    let router = build_router(Arc::clone(&state));
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("gateway listening on {}", listener.local_addr()?);
    let sd = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(sd.cancelled_owned())
        .await;
        if let Err(e) = result {
            error!("gateway HTTP server error: {e}");
        }
    });

    if let Some(health_port) = health_port {
        let health_router = build_health_router(Arc::clone(&state));
        let addr = format!("{host}:{health_port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("health probe listening on {addr}");
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, health_router)
                .with_graceful_shutdown(sd.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!("health server error: {e}");
            }
        });
    }

    spawn_signal_handler(shutdown.clone());

    shutdown.cancelled().await;
    info!("shutdown signal received, draining for up to {drain_secs}s");
    tokio::time::sleep(std::time::Duration::from_secs(drain_secs)).await;
    Ok(())
}

async fn ensure_chat_stream(client: &async_nats::Client) -> anyhow::Result<()> {
    let js = jetstream::new(client.clone());
    js.get_or_create_stream(StreamConfig {
        name: CHAT_STREAM_NAME.to_string(),
        subjects: vec![CHAT_SUBJECT_FILTER.to_string()],
        ..Default::default()
    })
    .await?;
    Ok(())
}

fn spawn_presence_router(client: async_nats::Client, hub: Arc<Hub>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let router = PresenceRouter::new(client, hub);
        if let Err(e) = router.run(shutdown).await {
            error!("presence router exited: {e}");
        }
    });
}

fn spawn_rate_limiter_sweep(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    limiter.sweep(std::time::Duration::from_secs(300)).await;
                }
            }
        }
    });
}

/// First signal triggers graceful shutdown; a second forces an
/// immediate exit rather than waiting out the drain deadline.
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
