// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use clap::Parser;

/// Chat Worker + Presence/Read-Receipt Engine process.
#[derive(Debug, Parser)]
#[command(name = "fabric-worker", version, about)]
pub struct Config {
    /// Health-check-only HTTP port.
    #[arg(long, env = "FABRIC_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Host address the health server binds to.
    #[arg(long, env = "FABRIC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Metrics exporter port (Prometheus text exposition).
    #[arg(long, env = "FABRIC_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// NATS server URL.
    #[arg(long, env = "FABRIC_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Redis connection URL for the group-member cache.
    #[arg(long, env = "FABRIC_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Postgres connection string for the durable store.
    #[arg(long, env = "FABRIC_DATABASE_URL")]
    pub database_url: String,

    /// Chat-ingress consumer prefetch (max_ack_pending), the "manual
    /// ack, prefetch 20" of spec.md §6.
    #[arg(long, env = "FABRIC_PREFETCH", default_value = "20")]
    pub prefetch: i64,

    /// Bounded redelivery count before a transient persist failure is
    /// dead-lettered instead of retried again.
    #[arg(long, env = "FABRIC_MAX_REDELIVERY", default_value = "5")]
    pub max_redelivery: u64,

    /// Read-receipt batching window, milliseconds.
    #[arg(long, env = "FABRIC_RECEIPT_BATCH_MS", default_value = "50")]
    pub receipt_batch_ms: u64,

    /// Read-receipt worker pool size (competing consumers on
    /// `read.receipts`).
    #[arg(long, env = "FABRIC_RECEIPT_WORKERS", default_value = "3")]
    pub receipt_workers: usize,

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
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("--database-url must be set");
        }
        if self.prefetch <= 0 {
            anyhow::bail!("--prefetch must be positive");
        }
        if self.receipt_workers == 0 {
            anyhow::bail!("--receipt-workers must be nonzero");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
