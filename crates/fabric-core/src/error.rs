// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the WebSocket transport and the
/// internal broker/store/cache failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    Validation,
    RateLimited,
    PublishFailed,
    PersistTransient,
    PersistTerminal,
    CacheUnavailable,
    BrokerUnavailable,
    SessionFull,
    SessionClosed,
    Internal,
}

impl ErrorCode {
    /// WebSocket close code this error should map to when it is fatal
    /// to the connection, `None` if it is reported in-band instead.
    pub fn ws_close_code(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(4001),
            Self::SessionFull => Some(4008),
            Self::SessionClosed => Some(1000),
            Self::RateLimited
            | Self::Validation
            | Self::PublishFailed
            | Self::PersistTransient
            | Self::PersistTerminal
            | Self::CacheUnavailable
            | Self::BrokerUnavailable
            | Self::Internal => None,
        }
    }

    /// Whether the originating operation may be safely retried by the
    /// client without risking a duplicate side effect.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::PublishFailed
                | Self::PersistTransient
                | Self::CacheUnavailable
                | Self::BrokerUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation => "VALIDATION",
            Self::RateLimited => "RATE_LIMITED",
            Self::PublishFailed => "PUBLISH_FAILED",
            Self::PersistTransient => "PERSIST_TRANSIENT",
            Self::PersistTerminal => "PERSIST_TERMINAL",
            Self::CacheUnavailable => "CACHE_UNAVAILABLE",
            Self::BrokerUnavailable => "BROKER_UNAVAILABLE",
            Self::SessionFull => "SESSION_FULL",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
