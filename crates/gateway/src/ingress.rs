// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Ingress path: a validated `SendMessage` from a session becomes a
//! durable envelope published to the chat stream, confirmed before the
//! sender is told anything succeeded (§4.4).

use std::time::Duration;

use async_nats::jetstream::{self, context::Context as JetStreamContext};
use fabric_core::ids::{ChatId, ClientUuid, UserId};
use fabric_core::protocol::ChatEnvelope;
use fabric_core::subjects::chat_subject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressError {
    Nacked,
    Timeout,
    Unserializable,
}

pub struct IngressPublisher {
    js: JetStreamContext,
    confirm_timeout: Duration,
}

impl IngressPublisher {
    pub fn new(nats_client: async_nats::Client, confirm_timeout: Duration) -> Self {
        Self {
            js: jetstream::new(nats_client),
            confirm_timeout,
        }
    }

    /// Publish and wait for the JetStream publish ack (the publisher
    /// confirm). On NACK or timeout the caller surfaces `PublishFailed`
    /// keyed by the original `clientUuid`; no durability is claimed.
    pub async fn publish(
        &self,
        client_uuid: ClientUuid,
        chat_id: ChatId,
        sender_id: UserId,
        body: String,
        media_url: Option<String>,
    ) -> Result<(), IngressError> {
        let envelope = ChatEnvelope {
            client_uuid,
            chat_id,
            sender_id,
            body,
            media_url,
        };
        let payload = serde_json::to_vec(&envelope).map_err(|_| IngressError::Unserializable)?;
        let subject = chat_subject(chat_id);

        let ack_future = self
            .js
            .publish(subject, payload.into())
            .await
            .map_err(|_| IngressError::Nacked)?;

        match tokio::time::timeout(self.confirm_timeout, ack_future).await {
            Ok(Ok(_ack)) => Ok(()),
            Ok(Err(_)) => Err(IngressError::Nacked),
            Err(_) => Err(IngressError::Timeout),
        }
    }
}

#[cfg(test)]
#[path = "ingress_tests.rs"]
mod tests;
