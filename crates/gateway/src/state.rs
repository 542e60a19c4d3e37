// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Shared process state for the gateway, analogous to the session
//! runner's `Store`: one instance per process, passed by `Arc` into
//! every handler and background task.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::delivery::DeliveryRouter;
use crate::hub::SharedHub;
use crate::ingress::IngressPublisher;
use crate::presence::PresencePublisher;
use crate::ratelimit::RateLimiter;
use crate::registry::CacheClient;
use crate::store::Store;
use crate::transport::auth::JwtVerifier;

pub struct AppState {
    pub config: Config,
    pub hub: SharedHub,
    pub cache: CacheClient,
    pub store: Store,
    pub ingress: IngressPublisher,
    pub delivery: Arc<DeliveryRouter>,
    pub presence: PresencePublisher,
    pub rate_limiter: Arc<RateLimiter>,
    pub jwt: JwtVerifier,
    pub nats: async_nats::Client,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn conn_ttl(&self) -> Duration {
        Duration::from_secs(self.config.conn_ttl_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.config.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.idle_timeout_secs)
    }
}
