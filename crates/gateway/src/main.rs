// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use gateway::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    if let Err(e) = gateway::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
