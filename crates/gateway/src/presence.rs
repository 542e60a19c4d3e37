// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Presence write-side: on session open/close, write the cache key and
//! publish a transient event on the presence fanout subject (§4.7).
//! Presence broadcasts are never persisted.

use std::time::Duration;

use fabric_core::ids::UserId;
use fabric_core::protocol::{PresenceEvent, ServerFrame};
use fabric_core::subjects::PRESENCE_EVENTS_SUBJECT;
use fabric_core::time::epoch_secs;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::SharedHub;
use crate::registry::CacheClient;

pub struct PresencePublisher {
    client: async_nats::Client,
    cache: CacheClient,
    conn_ttl: Duration,
}

impl PresencePublisher {
    pub fn new(client: async_nats::Client, cache: CacheClient, conn_ttl: Duration) -> Self {
        Self {
            client,
            cache,
            conn_ttl,
        }
    }

    pub async fn mark_online(&self, user_id: UserId) {
        let last_seen = epoch_secs();
        self.cache
            .set_presence(user_id, true, last_seen, self.conn_ttl + Duration::from_secs(5))
            .await;
        self.publish(user_id, true, last_seen).await;
    }

    pub async fn mark_offline(&self, user_id: UserId) {
        let last_seen = epoch_secs();
        self.cache
            .set_presence(user_id, false, last_seen, self.conn_ttl + Duration::from_secs(5))
            .await;
        self.publish(user_id, false, last_seen).await;
    }

    async fn publish(&self, user_id: UserId, online: bool, last_seen: i64) {
        let event = PresenceEvent {
            user_id,
            online,
            last_seen,
        };
        let Ok(payload) = serde_json::to_vec(&event) else {
            warn!(%user_id, "failed to serialize presence event");
            return;
        };
        if let Err(e) = self
            .client
            .publish(PRESENCE_EVENTS_SUBJECT, payload.into())
            .await
        {
            warn!(%user_id, error = %e, "presence publish failed");
        }
    }
}

/// Presence read-side: one global core-NATS subscription per replica on
/// `presence.events`, turning each `PresenceEvent` into a `Presence`
/// frame delivered to every locally-connected session. Unlike the
/// delivery path this is not scoped per chat — presence is a fanout
/// broadcast (§9), so every replica runs exactly one of these from
/// startup rather than lazily per chat.
pub struct PresenceRouter {
    client: async_nats::Client,
    hub: SharedHub,
}

impl PresenceRouter {
    pub fn new(client: async_nats::Client, hub: SharedHub) -> Self {
        Self { client, hub }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut sub = self.client.subscribe(PRESENCE_EVENTS_SUBJECT).await?;
        debug!("presence subscription active");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    self.handle_message(&msg.payload).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, payload: &[u8]) {
        route_presence_payload(&self.hub, payload).await;
    }
}

/// Parse a presence-subject payload and fan it out via the hub. Split
/// out of `PresenceRouter` so it can be exercised without a live NATS
/// connection.
async fn route_presence_payload(hub: &SharedHub, payload: &[u8]) -> Option<usize> {
    let event: PresenceEvent = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "dropping malformed presence event");
            return None;
        }
    };
    let frame = ServerFrame::Presence {
        user_id: event.user_id,
        online: event.online,
        last_seen: event.last_seen,
    };
    Some(hub.broadcast_to_all(frame).await)
}

#[cfg(test)]
#[path = "presence_tests.rs"]
mod tests;
