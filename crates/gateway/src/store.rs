// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Durable-store fallback path for the gateway: resolving a user's chat
//! memberships at session open (§4.1 — "binds delivery queue for each
//! of the user's chats on this replica") and, on a group-member cache
//! miss, the members of a chat (§4.3 failure semantics).

use fabric_core::ids::{ChatId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Chat ids `user_id` is a member of, used once at session open to
    /// prime the hub's chat subscriptions and the delivery path.
    pub async fn user_chat_ids(&self, user_id: UserId) -> Vec<ChatId> {
        let rows = sqlx::query_scalar::<_, uuid::Uuid>("SELECT chat_id FROM memberships WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await;
        match rows {
            Ok(rows) => rows.into_iter().map(ChatId::from).collect(),
            Err(e) => {
                warn!(%user_id, error = %e, "failed to resolve chat memberships");
                Vec::new()
            }
        }
    }

    /// Member user ids of `chat_id`, used when the group-member cache
    /// misses (§4.3: "recipient resolution falls back to the durable
    /// store").
    pub async fn chat_member_ids(&self, chat_id: ChatId) -> Vec<UserId> {
        let rows = sqlx::query_scalar::<_, uuid::Uuid>("SELECT user_id FROM memberships WHERE chat_id = $1")
            .bind(chat_id.0)
            .fetch_all(&self.pool)
            .await;
        match rows {
            Ok(rows) => rows.into_iter().map(UserId::from).collect(),
            Err(e) => {
                warn!(%chat_id, error = %e, "failed to resolve chat members from store");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
