use super::*;
use clap::Parser;

fn base_args() -> Vec<&'static str> {
    vec![
        "fabric-gateway",
        "--database-url",
        "postgres://localhost/fabric",
        "--jwt-public-key",
        "/tmp/key.pem",
    ]
}

#[test]
fn validates_with_minimal_required_args() {
    let config = Config::parse_from(base_args());
    assert!(config.validate().is_ok());
}

#[test]
fn rejects_empty_database_url() {
    let mut config = Config::parse_from(base_args());
    config.database_url = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn rejects_ping_interval_not_below_idle_timeout() {
    let mut config = Config::parse_from(base_args());
    config.ping_interval_secs = 90;
    config.idle_timeout_secs = 90;
    assert!(config.validate().is_err());
}

#[test]
fn rejects_unknown_log_format() {
    let mut config = Config::parse_from(base_args());
    config.log_format = "xml".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn effective_replica_id_falls_back_to_hostname_env() {
    let config = Config::parse_from(base_args());
    assert!(!config.effective_replica_id().is_empty());
}
