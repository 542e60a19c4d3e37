// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Chat Worker: competing consumers pulling from the durable
//! `CHAT_MESSAGES` stream. Per message: persist, resolve recipients,
//! write `sent` receipts, publish the delivery envelope, publish the
//! sender's `Delivered` ack, ack the ingress delivery (§4.5).

use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::{self, AckKind};
use fabric_core::ids::{ChatId, MessageId, UserId};
use fabric_core::protocol::{ChatEnvelope, DeliveryEnvelope};
use fabric_core::subjects::{
    chat_subject, delivered_ack_subject, delivery_subject, CHAT_CONSUMER_DURABLE,
    CHAT_STREAM_NAME, CHAT_SUBJECT_FILTER,
};
use fabric_core::time::epoch_ms;
use futures_util::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::GroupCache;
use crate::store::{is_duplicate_client_uuid, Store};

pub struct ChatWorker {
    nats: async_nats::Client,
    store: Store,
    cache: GroupCache,
    prefetch: i64,
    max_redelivery: u64,
}

impl ChatWorker {
    pub fn new(nats: async_nats::Client, store: Store, cache: GroupCache, prefetch: i64, max_redelivery: u64) -> Self {
        Self {
            nats,
            store,
            cache,
            prefetch,
            max_redelivery,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let js = jetstream::new(self.nats.clone());
        let stream = js.get_stream(CHAT_STREAM_NAME).await?;
        let consumer = stream
            .get_or_create_consumer(
                CHAT_CONSUMER_DURABLE,
                PullConfig {
                    durable_name: Some(CHAT_CONSUMER_DURABLE.to_string()),
                    filter_subject: CHAT_SUBJECT_FILTER.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: self.prefetch,
                    ..Default::default()
                },
            )
            .await?;

        let mut messages = consumer.messages().await?;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = messages.next() => {
                    let Some(message) = next else { break };
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, "pull consumer error");
                            continue;
                        }
                    };
                    // Every in-flight message finishes before the worker
                    // exits even if shutdown fires mid-handle (§5:
                    // "Worker cancellation ... finishes the current
                    // message for the chat worker before exiting").
                    self.handle_delivery(message).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_delivery(&self, message: async_nats::jetstream::Message) {
        let envelope: ChatEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping unparseable ingress envelope (poison)");
                counter!("fabric_worker_messages_term_total").increment(1);
                let _ = message.ack_with(AckKind::Term).await;
                return;
            }
        };

        let inserted = self
            .store
            .insert_message(
                envelope.client_uuid.0,
                envelope.chat_id,
                envelope.sender_id,
                &envelope.body,
                envelope.media_url.as_deref(),
                epoch_ms(),
            )
            .await;

        let inserted = match inserted {
            Ok(inserted) => inserted,
            Err(e) if is_duplicate_client_uuid(&e) => {
                debug!(client_uuid = %envelope.client_uuid, "duplicate ingress delivery, acking as replay");
                counter!("fabric_worker_messages_deduped_total").increment(1);
                let _ = message.ack().await;
                return;
            }
            Err(e) => {
                let redelivered = message.info().map(|i| i.delivered).unwrap_or(1);
                if redelivered >= self.max_redelivery {
                    error!(error = %e, client_uuid = %envelope.client_uuid, "persist failed past redelivery cap, dead-lettering");
                    counter!("fabric_worker_messages_term_total").increment(1);
                    let _ = message.ack_with(AckKind::Term).await;
                } else {
                    warn!(error = %e, client_uuid = %envelope.client_uuid, redelivered, "transient persist failure, nacking");
                    counter!("fabric_worker_messages_nacked_total").increment(1);
                    let _ = message.ack_with(AckKind::Nak(Some(Duration::from_millis(250)))).await;
                }
                return;
            }
        };
        counter!("fabric_worker_messages_persisted_total").increment(1);

        self.resolve_and_receipt(envelope.chat_id, inserted.id, inserted.created_at).await;

        let delivery = DeliveryEnvelope::Message {
            id: inserted.id,
            chat_id: envelope.chat_id,
            sender_id: envelope.sender_id,
            body: envelope.body.clone(),
            media_url: envelope.media_url.clone(),
            created_at: inserted.created_at,
        };
        if self.publish_delivery(envelope.chat_id, &delivery).await.is_err() {
            let _ = message.ack_with(AckKind::Nak(Some(Duration::from_millis(250)))).await;
            return;
        }

        let ack = DeliveryEnvelope::Delivered {
            uuid: envelope.client_uuid,
            msg_id: inserted.id,
        };
        if let Err(e) = self.publish_ack(envelope.sender_id, &ack).await {
            warn!(error = %e, "failed to publish sender delivered-ack");
        }

        let _ = message.ack().await;
    }

    async fn resolve_and_receipt(&self, chat_id: ChatId, msg_id: MessageId, ts: i64) {
        let members = match self.cache.members(chat_id).await {
            Some(members) => members,
            None => {
                let members = self.store.chat_member_ids(chat_id).await.unwrap_or_default();
                self.cache.populate(chat_id, &members).await;
                members
            }
        };
        for user_id in members {
            if let Err(e) = self.store.insert_sent_receipt(msg_id, user_id, ts).await {
                warn!(%user_id, %msg_id, error = %e, "failed to write sent receipt");
            }
        }
    }

    async fn publish_delivery(&self, chat_id: ChatId, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(envelope)?;
        self.nats.publish(delivery_subject(chat_id), payload.into()).await?;
        Ok(())
    }

    async fn publish_ack(&self, sender_id: UserId, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(envelope)?;
        self.nats
            .publish(delivered_ack_subject(sender_id), payload.into())
            .await?;
        Ok(())
    }
}

/// Re-exported for the gateway's `ingress.rs`, which publishes onto the
/// same subject this worker's consumer filters on.
pub fn chat_ingress_subject(chat_id: ChatId) -> String {
    chat_subject(chat_id)
}

#[cfg(test)]
#[path = "chat_worker_tests.rs"]
mod tests;
