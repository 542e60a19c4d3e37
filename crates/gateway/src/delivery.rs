// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Delivery path: one core-NATS subscription per chat id that currently
//! has a local subscriber on this replica, added on first local
//! subscribe and retained for the replica's lifetime (§4.6 — unbinding
//! on last-leave is a deferred optimization, not implemented here).

use std::collections::HashMap;
use std::sync::Arc;

use fabric_core::ids::ChatId;
use fabric_core::protocol::{DeliveryEnvelope, ServerFrame};
use fabric_core::subjects::delivery_subject;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::SharedHub;

pub struct DeliveryRouter {
    client: async_nats::Client,
    hub: SharedHub,
    active: Mutex<HashMap<ChatId, tokio::task::JoinHandle<()>>>,
}

impl DeliveryRouter {
    pub fn new(client: async_nats::Client, hub: SharedHub) -> Arc<Self> {
        Arc::new(Self {
            client,
            hub,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Ensure a delivery subscription exists for `chat_id`. Idempotent —
    /// called every time a session subscribes to a chat; only the first
    /// caller for a given chat actually spawns a subscriber task.
    pub async fn ensure_subscribed(self: &Arc<Self>, chat_id: ChatId, shutdown: CancellationToken) {
        let mut active = self.active.lock().await;
        if active.contains_key(&chat_id) {
            return;
        }
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            router.run_subscription(chat_id, shutdown).await;
        });
        active.insert(chat_id, handle);
    }

    async fn run_subscription(&self, chat_id: ChatId, shutdown: CancellationToken) {
        let subject = delivery_subject(chat_id);
        let mut sub = match self.client.subscribe(subject.clone()).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%chat_id, error = %e, "failed to subscribe to delivery subject");
                return;
            }
        };
        debug!(%chat_id, %subject, "delivery subscription active");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    self.handle_message(chat_id, &msg.payload).await;
                }
            }
        }
    }

    async fn handle_message(&self, chat_id: ChatId, payload: &[u8]) {
        route_delivery_payload(&self.hub, chat_id, payload).await;
    }
}

/// Parse a delivery-subject payload and fan it out via the hub. Split
/// out of `DeliveryRouter` so it can be exercised without a live NATS
/// connection.
async fn route_delivery_payload(hub: &SharedHub, chat_id: ChatId, payload: &[u8]) -> Option<usize> {
    let envelope: DeliveryEnvelope = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(%chat_id, error = %e, "dropping malformed delivery envelope");
            return None;
        }
    };
    let frame: ServerFrame = envelope.into();
    Some(hub.broadcast_to_chat(chat_id, frame).await)
}

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;
