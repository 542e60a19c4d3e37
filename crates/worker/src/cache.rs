// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Group-member cache reads/writes for the Chat Worker's recipient
//! resolution step (§4.5 step 3). Narrower than the gateway's
//! `registry.rs` — the worker never touches the connection registry or
//! presence keys, only `grp:<chatId>`.

use std::time::Duration;

use fabric_core::ids::{ChatId, UserId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

const CACHE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct GroupCache {
    conn: ConnectionManager,
}

impl GroupCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub async fn members(&self, chat_id: ChatId) -> Option<Vec<UserId>> {
        let key = group_key(chat_id);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = match tokio::time::timeout(CACHE_TIMEOUT, conn.smembers(key)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(%chat_id, error = %e, "group cache read failed");
                return None;
            }
            Err(_) => {
                warn!(%chat_id, "group cache read timed out");
                return None;
            }
        };
        if raw.is_empty() {
            return None;
        }
        Some(
            raw.into_iter()
                .filter_map(|s| uuid::Uuid::parse_str(&s).ok().map(UserId::from))
                .collect(),
        )
    }

    pub async fn populate(&self, chat_id: ChatId, members: &[UserId]) {
        if members.is_empty() {
            return;
        }
        let key = group_key(chat_id);
        let ids: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        let mut conn = self.conn.clone();
        let _ = tokio::time::timeout(CACHE_TIMEOUT, conn.sadd::<_, _, ()>(key, ids)).await;
    }
}

fn group_key(chat_id: ChatId) -> String {
    format!("grp:{chat_id}")
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
