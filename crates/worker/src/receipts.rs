// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Read-receipt engine: a competing-consumer pool drains `read.receipts`
//! (queue group `receipt-workers`), batches updates over a short
//! window keyed by `(chatId, userId)` taking the max `msgId`, commits
//! in bulk, and publishes a `Read` envelope per updated pair (§4.7).

use std::collections::HashMap;
use std::time::Duration;

use fabric_core::ids::{ChatId, UserId};
use fabric_core::protocol::{DeliveryEnvelope, ReadReceiptEvent};
use fabric_core::subjects::{delivery_subject, READ_RECEIPTS_QUEUE_GROUP, READ_RECEIPTS_SUBJECT};
use futures_util::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::store::Store;

pub struct ReceiptEngine {
    nats: async_nats::Client,
    store: Store,
    batch_window: Duration,
}

impl ReceiptEngine {
    pub fn new(nats: async_nats::Client, store: Store, batch_window: Duration) -> Self {
        Self {
            nats,
            store,
            batch_window,
        }
    }

    /// Run one competing-consumer worker. Spawn `N` of these to match
    /// spec.md's fixed-size pool.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut sub = self
            .nats
            .queue_subscribe(READ_RECEIPTS_SUBJECT, READ_RECEIPTS_QUEUE_GROUP.to_string())
            .await?;

        let mut batch: HashMap<(ChatId, UserId), i64> = HashMap::new();
        let mut ticker = tokio::time::interval(self.batch_window);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush(&mut batch).await;
                    break;
                }
                _ = ticker.tick() => {
                    self.flush(&mut batch).await;
                }
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    let Ok(event) = serde_json::from_slice::<ReadReceiptEvent>(&msg.payload) else {
                        warn!("dropping malformed read-receipt event");
                        continue;
                    };
                    fold_into_batch(&mut batch, event);
                }
            }
        }
        Ok(())
    }

    async fn flush(&self, batch: &mut HashMap<(ChatId, UserId), i64>) {
        if batch.is_empty() {
            return;
        }
        let updates: Vec<((ChatId, UserId), i64)> = batch.drain().collect();
        if let Err(e) = self.store.commit_read_receipts(&updates).await {
            warn!(error = %e, "failed to commit read-receipt batch");
            return;
        }
        counter!("fabric_worker_read_receipts_committed_total").increment(updates.len() as u64);
        for ((chat_id, user_id), msg_id) in updates {
            self.publish_read(chat_id, user_id, msg_id).await;
        }
    }

    async fn publish_read(&self, chat_id: ChatId, user_id: UserId, msg_id: i64) {
        let envelope = DeliveryEnvelope::Read {
            chat_id,
            user_id,
            msg_id,
        };
        let Ok(payload) = serde_json::to_vec(&envelope) else {
            return;
        };
        if let Err(e) = self.nats.publish(delivery_subject(chat_id), payload.into()).await {
            warn!(%chat_id, %user_id, error = %e, "failed to publish read receipt broadcast");
        }
    }
}

/// Fold one event into the running batch, keeping the max `msgId` per
/// `(chatId, userId)` — `lastReadMsgId` only ever advances.
fn fold_into_batch(batch: &mut HashMap<(ChatId, UserId), i64>, event: ReadReceiptEvent) {
    batch
        .entry((event.chat_id, event.user_id))
        .and_modify(|existing| *existing = (*existing).max(event.msg_id))
        .or_insert(event.msg_id);
}

#[cfg(test)]
#[path = "receipts_tests.rs"]
mod tests;
