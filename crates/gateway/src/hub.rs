// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! In-process session index for one replica: `(userId, deviceId) -> session`
//! and `chatId -> set<(userId, deviceId)>`. Non-persistent, thread-safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fabric_core::ids::{ChatId, DeviceId, UserId};
use fabric_core::protocol::ServerFrame;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Non-owning handle the hub holds for a session. The session owns the
/// socket and the receiving end of this channel; the hub only ever
/// writes to it, never reads from or closes it directly. `close` is the
/// one signal the hub is allowed to raise against a session it does not
/// own — used to displace a prior session on re-registration (§4.1,
/// S6).
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: DeviceId,
    tx: mpsc::Sender<ServerFrame>,
    close: CancellationToken,
}

impl SessionHandle {
    pub fn new(device_id: DeviceId, tx: mpsc::Sender<ServerFrame>, close: CancellationToken) -> Self {
        Self { device_id, tx, close }
    }

    /// Non-blocking send. Never awaits on I/O, never holds the hub's lock.
    pub fn try_send(&self, frame: ServerFrame) -> SendOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Signal this session's read/write loop to close. Used by the hub
    /// to displace a session on re-registration; the session's own
    /// `select!` observes `close.cancelled()` and exits with code 1000.
    pub fn close(&self) {
        self.close.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Dropped,
    Closed,
}

type SessionKey = (UserId, DeviceId);

#[derive(Default)]
struct HubInner {
    sessions: HashMap<SessionKey, SessionHandle>,
    chat_members: HashMap<ChatId, HashSet<SessionKey>>,
}

/// The hub. One instance per replica process, shared via `Arc`.
pub struct Hub {
    inner: RwLock<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HubInner::default()),
        }
    }

    /// Register a session, closing and returning any prior session that
    /// occupied the same `(userId, deviceId)` slot.
    pub async fn register(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        handle: SessionHandle,
    ) -> Option<SessionHandle> {
        let key = (user_id, device_id);
        let mut inner = self.inner.write().await;
        let prior = inner.sessions.insert(key, handle);
        if let Some(ref prior) = prior {
            debug!(?user_id, "displacing existing session for (user, device)");
            prior.close();
            counter!("fabric_gateway_sessions_displaced_total").increment(1);
        }
        gauge!("fabric_gateway_active_sessions").set(inner.sessions.len() as f64);
        prior
    }

    /// Remove a session and drop it from every chat it was subscribed to.
    pub async fn unregister(&self, user_id: UserId, device_id: &DeviceId) {
        let key = (user_id, device_id.clone());
        let mut inner = self.inner.write().await;
        inner.sessions.remove(&key);
        for members in inner.chat_members.values_mut() {
            members.remove(&key);
        }
        inner.chat_members.retain(|_, members| !members.is_empty());
        gauge!("fabric_gateway_active_sessions").set(inner.sessions.len() as f64);
    }

    pub async fn subscribe(&self, user_id: UserId, device_id: DeviceId, chat_id: ChatId) {
        let mut inner = self.inner.write().await;
        inner
            .chat_members
            .entry(chat_id)
            .or_default()
            .insert((user_id, device_id));
    }

    pub async fn unsubscribe(&self, user_id: UserId, device_id: &DeviceId, chat_id: ChatId) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.chat_members.get_mut(&chat_id) {
            members.remove(&(user_id, device_id.clone()));
            if members.is_empty() {
                inner.chat_members.remove(&chat_id);
            }
        }
    }

    /// Whether this replica currently has at least one local subscriber
    /// for `chat_id` — governs whether the delivery path needs a binding.
    pub async fn has_local_subscriber(&self, chat_id: ChatId) -> bool {
        let inner = self.inner.read().await;
        inner
            .chat_members
            .get(&chat_id)
            .is_some_and(|m| !m.is_empty())
    }

    /// Best-effort fan-out: snapshot the session set under a read lock,
    /// then send outside the lock so slow/blocked sessions never stall
    /// other readers or writers of the hub.
    pub async fn broadcast_to_chat(&self, chat_id: ChatId, frame: ServerFrame) -> usize {
        let handles: Vec<SessionHandle> = {
            let inner = self.inner.read().await;
            let Some(members) = inner.chat_members.get(&chat_id) else {
                return 0;
            };
            members
                .iter()
                .filter_map(|key| inner.sessions.get(key).cloned())
                .collect()
        };
        let mut delivered = 0;
        for handle in &handles {
            if matches!(handle.try_send(frame.clone()), SendOutcome::Queued) {
                delivered += 1;
            }
        }
        counter!("fabric_gateway_frames_delivered_total").increment(delivered as u64);
        delivered
    }

    /// Best-effort fan-out to every session on this replica, regardless
    /// of chat membership — the presence fanout is a global broadcast,
    /// not scoped to a chat (spec §9: "canonical choice is fanout for
    /// presence events").
    pub async fn broadcast_to_all(&self, frame: ServerFrame) -> usize {
        let handles: Vec<SessionHandle> = {
            let inner = self.inner.read().await;
            inner.sessions.values().cloned().collect()
        };
        let mut delivered = 0;
        for handle in &handles {
            if matches!(handle.try_send(frame.clone()), SendOutcome::Queued) {
                delivered += 1;
            }
        }
        counter!("fabric_gateway_frames_delivered_total").increment(delivered as u64);
        delivered
    }

    /// Deliver directly to one `(user, device)` pair, e.g. a `Delivered`
    /// acknowledgement scoped to the sender alone.
    pub async fn send_to(&self, user_id: UserId, device_id: &DeviceId, frame: ServerFrame) -> SendOutcome {
        let inner = self.inner.read().await;
        match inner.sessions.get(&(user_id, device_id.clone())) {
            Some(handle) => handle.try_send(frame),
            None => SendOutcome::Closed,
        }
    }

    /// Active session count, for metrics.
    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Number of local sessions still open for `user_id`, across all of
    /// their devices. Used to gate presence transitions: a user only
    /// goes offline once their *own* last session on this replica
    /// closes, not when the replica happens to be empty (§3, §8
    /// property 7).
    pub async fn sessions_for_user(&self, user_id: UserId) -> usize {
        self.inner
            .read()
            .await
            .sessions
            .keys()
            .filter(|(uid, _)| *uid == user_id)
            .count()
    }
}

pub type SharedHub = Arc<Hub>;

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
