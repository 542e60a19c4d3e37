// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! NATS subject naming. Centralized so the gateway's publishers and the
//! worker's consumers never drift apart on a string literal.

use crate::ids::ChatId;

pub const CHAT_STREAM_NAME: &str = "CHAT_MESSAGES";
pub const CHAT_SUBJECT_FILTER: &str = "chat.*";
pub const CHAT_CONSUMER_DURABLE: &str = "chat-workers";
pub const READ_RECEIPTS_SUBJECT: &str = "read.receipts";
pub const READ_RECEIPTS_QUEUE_GROUP: &str = "receipt-workers";
pub const PRESENCE_EVENTS_SUBJECT: &str = "presence.events";

/// Subject an inbound chat message is published to, and the subject the
/// chat worker's durable consumer is bound to (via `CHAT_SUBJECT_FILTER`).
pub fn chat_subject(chat_id: ChatId) -> String {
    format!("chat.{chat_id}")
}

/// Subject a gateway replica subscribes to for fan-out delivery of
/// messages in a given chat to its locally-connected sessions.
pub fn delivery_subject(chat_id: ChatId) -> String {
    format!("delivery.{chat_id}")
}

/// Subject the chat worker publishes a `Delivered` envelope to, scoped
/// to the sending user so only their own sessions observe it, never the
/// rest of the chat (Open Question resolution #2 in SPEC_FULL.md §10).
/// Scoped by user rather than by (chat, user): a sender's other open
/// devices should also see the ack regardless of which chat it was for.
pub fn delivered_ack_subject(sender: crate::ids::UserId) -> String {
    format!("delivery.ack.{sender}")
}

#[cfg(test)]
#[path = "subjects_tests.rs"]
mod tests;
