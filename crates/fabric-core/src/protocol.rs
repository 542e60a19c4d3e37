// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! The client sub-protocol: tagged JSON frames exchanged over the
//! WebSocket connection. Closed enums on both sides — an unrecognized
//! `type` fails to deserialize and is handled as a soft parse error by
//! the caller, never a silent pass-through.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, ClientUuid, MessageId, UserId};

/// Frames a session receives from its connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum ClientFrame {
    SendMessage {
        uuid: ClientUuid,
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        body: String,
        #[serde(rename = "mediaUrl", skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
    },
    Read {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "msgId")]
        msg_id: i64,
    },
    Typing {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
    },
    Ping {
        ts: i64,
    },
}

/// Frames a session emits to its connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum ServerFrame {
    Message {
        id: MessageId,
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "userId")]
        user_id: UserId,
        body: String,
        #[serde(rename = "mediaUrl", skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        #[serde(rename = "createdAt")]
        created_at: i64,
    },
    Delivered {
        uuid: ClientUuid,
        #[serde(rename = "msgId")]
        msg_id: MessageId,
    },
    Read {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "msgId")]
        msg_id: i64,
    },
    Typing {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    Presence {
        #[serde(rename = "userId")]
        user_id: UserId,
        online: bool,
        #[serde(rename = "lastSeen")]
        last_seen: i64,
    },
    Pong {
        ts: i64,
    },
    Error {
        code: crate::error::ErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        uuid: Option<ClientUuid>,
        message: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"Error","code":"Internal","message":"serialization failed"}"#.to_string()
        })
    }
}

/// An inbound message envelope as it travels through the broker from
/// ingress to the chat worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(rename = "clientUuid")]
    pub client_uuid: ClientUuid,
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    pub body: String,
    #[serde(rename = "mediaUrl", skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

/// An envelope as published on the delivery subject by the chat worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum DeliveryEnvelope {
    Message {
        id: MessageId,
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "senderId")]
        sender_id: UserId,
        body: String,
        #[serde(rename = "mediaUrl", skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        #[serde(rename = "createdAt")]
        created_at: i64,
    },
    Delivered {
        uuid: ClientUuid,
        #[serde(rename = "msgId")]
        msg_id: MessageId,
    },
    Read {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "msgId")]
        msg_id: i64,
    },
    Typing {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
}

impl From<DeliveryEnvelope> for ServerFrame {
    fn from(value: DeliveryEnvelope) -> Self {
        match value {
            DeliveryEnvelope::Message {
                id,
                chat_id,
                sender_id,
                body,
                media_url,
                created_at,
            } => ServerFrame::Message {
                id,
                chat_id,
                user_id: sender_id,
                body,
                media_url,
                created_at,
            },
            DeliveryEnvelope::Delivered { uuid, msg_id } => {
                ServerFrame::Delivered { uuid, msg_id }
            }
            DeliveryEnvelope::Read {
                chat_id,
                user_id,
                msg_id,
            } => ServerFrame::Read {
                chat_id,
                user_id,
                msg_id,
            },
            DeliveryEnvelope::Typing { chat_id, user_id } => {
                ServerFrame::Typing { chat_id, user_id }
            }
        }
    }
}

/// A read-receipt update as published by a session onto `read.receipts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptEvent {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(rename = "msgId")]
    pub msg_id: i64,
}

/// A presence transition as published onto the presence fanout subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub online: bool,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
