// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use clap::Parser;

/// Front-end replica: session upgrade, hub, ingress, delivery fan-out.
#[derive(Debug, Parser)]
#[command(name = "fabric-gateway", version, about)]
pub struct Config {
    /// HTTP/WebSocket port to listen on.
    #[arg(long, env = "FABRIC_PORT", default_value = "8080")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "FABRIC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Health-check-only HTTP port.
    #[arg(long, env = "FABRIC_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Metrics exporter port (Prometheus text exposition).
    #[arg(long, env = "FABRIC_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Stable identifier for this replica, used in logs and metrics.
    /// Defaults to the hostname if unset.
    #[arg(long, env = "FABRIC_REPLICA_ID")]
    pub replica_id: Option<String>,

    /// NATS server URL.
    #[arg(long, env = "FABRIC_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Redis connection URL for the connection registry, presence, and
    /// group-member cache.
    #[arg(long, env = "FABRIC_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Postgres connection string, used as a fallback recipient-resolution
    /// path when the group-member cache misses.
    #[arg(long, env = "FABRIC_DATABASE_URL")]
    pub database_url: String,

    /// Path to the JWT verification key (public key, PEM).
    #[arg(long, env = "FABRIC_JWT_PUBLIC_KEY")]
    pub jwt_public_key: std::path::PathBuf,

    /// CORS allow-list, comma-separated origins. Empty disables CORS.
    #[arg(long, env = "FABRIC_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Connection registry TTL in seconds (T_conn in the design docs).
    #[arg(long, env = "FABRIC_CONN_TTL_SECS", default_value = "35")]
    pub conn_ttl_secs: u64,

    /// Keepalive ping interval in seconds (T_ping).
    #[arg(long, env = "FABRIC_PING_INTERVAL_SECS", default_value = "15")]
    pub ping_interval_secs: u64,

    /// Idle read deadline in seconds before a session is closed.
    #[arg(long, env = "FABRIC_IDLE_TIMEOUT_SECS", default_value = "90")]
    pub idle_timeout_secs: u64,

    /// Publisher-confirm deadline for ingress publishes, milliseconds.
    #[arg(long, env = "FABRIC_PUBLISH_TIMEOUT_MS", default_value = "500")]
    pub publish_timeout_ms: u64,

    /// Bounded outbound queue capacity per session.
    #[arg(long, env = "FABRIC_OUTBOUND_CAPACITY", default_value = "256")]
    pub outbound_capacity: usize,

    /// Upgrade rate limit: max upgrades per source address per minute.
    #[arg(long, env = "FABRIC_UPGRADE_RATE_PER_MIN", default_value = "20")]
    pub upgrade_rate_per_min: u32,

    /// Graceful shutdown drain deadline, seconds.
    #[arg(long, env = "FABRIC_DRAIN_SECS", default_value = "15")]
    pub drain_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "FABRIC_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FABRIC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("--port must be nonzero");
        }
        if self.database_url.trim().is_empty() {
            anyhow::bail!("--database-url must be set");
        }
        if self.conn_ttl_secs == 0 {
            anyhow::bail!("--conn-ttl-secs must be nonzero");
        }
        if self.ping_interval_secs >= self.idle_timeout_secs {
            anyhow::bail!("--ping-interval-secs must be less than --idle-timeout-secs");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// Resolve the replica identifier, falling back to the hostname.
    pub fn effective_replica_id(&self) -> String {
        self.replica_id.clone().unwrap_or_else(|| {
            hostname_fallback()
        })
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "replica-unknown".to_string())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
