// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Cache-backed connection registry, presence keys, and group-member
//! cache. All calls carry a timeout and degrade gracefully on cache
//! outage rather than failing the caller (§4.3): a registry write
//! failure just means the next heartbeat will retry it; a presence
//! read failure degrades to "unknown"; a group-member cache miss falls
//! back to the durable store.

use std::time::Duration;

use fabric_core::ids::{ChatId, DeviceId, UserId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

const CACHE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
}

impl CacheClient {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    async fn with_timeout<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(CACHE_TIMEOUT, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(error = %e, "cache call failed");
                None
            }
            Err(_) => {
                warn!("cache call timed out");
                None
            }
        }
    }

    /// Write `conn:<uid>:<dev> = replicaId` with TTL.
    pub async fn register_connection(
        &self,
        user_id: UserId,
        device_id: &DeviceId,
        replica_id: &str,
        ttl: Duration,
    ) -> Option<()> {
        let key = conn_key(user_id, device_id);
        let mut conn = self.conn.clone();
        self.with_timeout(async move {
            conn.set_ex::<_, _, ()>(key, replica_id, ttl.as_secs()).await
        })
        .await
    }

    pub async fn lookup_connection(&self, user_id: UserId, device_id: &DeviceId) -> Option<String> {
        let key = conn_key(user_id, device_id);
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.get::<_, Option<String>>(key).await })
            .await
            .flatten()
    }

    pub async fn deregister_connection(&self, user_id: UserId, device_id: &DeviceId) {
        let key = conn_key(user_id, device_id);
        let mut conn = self.conn.clone();
        let _ = self
            .with_timeout(async move { conn.del::<_, ()>(key).await })
            .await;
    }

    /// Write presence state with TTL = conn_ttl + 5s.
    pub async fn set_presence(&self, user_id: UserId, online: bool, last_seen: i64, ttl: Duration) {
        let key = presence_key(user_id);
        let value = format!("{online}:{last_seen}");
        let mut conn = self.conn.clone();
        let _ = self
            .with_timeout(async move { conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await })
            .await;
    }

    pub async fn get_presence(&self, user_id: UserId) -> Option<(bool, i64)> {
        let key = presence_key(user_id);
        let mut conn = self.conn.clone();
        let raw: String = self
            .with_timeout(async move { conn.get::<_, Option<String>>(key).await })
            .await
            .flatten()?;
        let (online_str, last_seen_str) = raw.split_once(':')?;
        Some((online_str == "true", last_seen_str.parse().ok()?))
    }

    /// Populate `grp:<chatId>` from a resolved member set, no TTL bound
    /// (evicted by LRU policy at the Redis instance level per §6).
    pub async fn cache_group_members(&self, chat_id: ChatId, members: &[UserId]) {
        if members.is_empty() {
            return;
        }
        let key = group_key(chat_id);
        let ids: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        let mut conn = self.conn.clone();
        let _ = self
            .with_timeout(async move { conn.sadd::<_, _, ()>(key, ids).await })
            .await;
    }

    pub async fn group_members(&self, chat_id: ChatId) -> Option<Vec<UserId>> {
        let key = group_key(chat_id);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .with_timeout(async move { conn.smembers::<_, Vec<String>>(key).await })
            .await?;
        if raw.is_empty() {
            return None;
        }
        Some(
            raw.into_iter()
                .filter_map(|s| uuid::Uuid::parse_str(&s).ok().map(UserId::from))
                .collect(),
        )
    }
}

fn conn_key(user_id: UserId, device_id: &DeviceId) -> String {
    format!("conn:{user_id}:{device_id}")
}

fn presence_key(user_id: UserId) -> String {
    format!("pres:{user_id}")
}

fn group_key(chat_id: ChatId) -> String {
    format!("grp:{chat_id}")
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
