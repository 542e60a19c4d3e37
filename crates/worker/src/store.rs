// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Durable-store access for the Chat Worker and the Read-Receipt
//! Engine: message insert, sent-receipt fan-out, recipient fallback
//! resolution, and the monotonic `lastReadMsgId` commit (§3, §4.5,
//! §4.7).

use fabric_core::ids::{ChatId, MessageId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Postgres's unique-violation SQLSTATE, used to distinguish a replayed
/// `clientUuid` (idempotent, ack-as-duplicate) from any other
/// persistence failure (transient, nack-with-requeue).
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug)]
pub struct InsertedMessage {
    pub id: MessageId,
    pub created_at: i64,
}

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

    /// Insert a message, returning its assigned id and timestamp. A
    /// unique-violation on `client_uuid` surfaces as `sqlx::Error`
    /// whose database code the caller inspects via
    /// [`is_duplicate_client_uuid`].
    pub async fn insert_message(
        &self,
        client_uuid: uuid::Uuid,
        chat_id: ChatId,
        sender_id: UserId,
        body: &str,
        media_url: Option<&str>,
        created_at: i64,
    ) -> Result<InsertedMessage, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO messages (client_uuid, chat_id, user_id, body, media_url, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(client_uuid)
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(body)
        .bind(media_url)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(InsertedMessage {
            id: MessageId::from(row.0),
            created_at,
        })
    }

    /// Best-effort `sent` receipt insert per recipient (§4.5 step 4 —
    /// individual failures are logged by the caller and never block
    /// the pipeline).
    pub async fn insert_sent_receipt(
        &self,
        msg_id: MessageId,
        user_id: UserId,
        ts: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO receipts (msg_id, user_id, status, ts) VALUES ($1, $2, 1, $3)
             ON CONFLICT (msg_id, user_id) DO NOTHING",
        )
        .bind(msg_id.0)
        .bind(user_id.0)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Member user ids of a chat, used when the group-member cache
    /// misses (§4.5 step 3).
    pub async fn chat_member_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>, sqlx::Error> {
        let rows: Vec<(uuid::Uuid,)> =
            sqlx::query_as("SELECT user_id FROM memberships WHERE chat_id = $1")
                .bind(chat_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| UserId::from(id)).collect())
    }

    /// Commit a batch of `(chatId, userId) -> maxMsgId` read-receipt
    /// updates. `lastReadMsgId` only ever advances (§3 invariant).
    pub async fn commit_read_receipts(
        &self,
        updates: &[((ChatId, UserId), i64)],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for ((chat_id, user_id), max_msg_id) in updates {
            sqlx::query(
                "UPDATE memberships SET last_read_msg_id = GREATEST(last_read_msg_id, $1)
                 WHERE chat_id = $2 AND user_id = $3",
            )
            .bind(max_msg_id)
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

/// True when `err` is a unique-violation on the message's idempotency
/// key, meaning this is a redelivered ingress envelope already
/// persisted — ack as a no-op rather than creating a duplicate.
pub fn is_duplicate_client_uuid(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
