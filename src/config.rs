//! Configuration for the relay core and the `spoke-relay` server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::logging::DEFAULT_FILTER;
use crate::registry::DEFAULT_SHARDS;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest accepted send request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 512_000;
/// Largest notification content embedded in a push.
pub const DEFAULT_PUSH_INLINE_LIMIT: usize = 1_500;

/// What a queue drain waits for before deleting a replayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReplayPolicy {
    /// Delete only after the device acknowledged the replayed frame.
    #[default]
    AwaitAck,
    /// Delete as soon as the frame was handed to the connection.
    DeleteOnSend,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub ack_timeout: Duration,
    pub replay_policy: ReplayPolicy,
    pub max_body_bytes: usize,
    pub push_inline_limit: usize,
    pub registry_shards: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            replay_policy: ReplayPolicy::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            push_inline_limit: DEFAULT_PUSH_INLINE_LIMIT,
            registry_shards: DEFAULT_SHARDS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Message relay with live delivery, offline queueing and push fallback.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "spoke-relay", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: SPOKE_BIND] [default: 0.0.0.0:8080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// SQLite database path; in-memory store when unset [env: SPOKE_DATABASE]
    #[arg(long, short = 'd')]
    pub database: Option<PathBuf>,

    /// Seconds to wait for a live delivery ack [env: SPOKE_ACK_TIMEOUT_SECS] [default: 10]
    #[arg(long)]
    pub ack_timeout_secs: Option<u64>,

    /// When replayed queue entries are deleted [env: SPOKE_REPLAY_POLICY] [default: await-ack]
    #[arg(long, value_enum)]
    pub replay_policy: Option<ReplayPolicy>,

    /// Log filter directive [env: SPOKE_LOG] [default: info]
    #[arg(long)]
    pub log: Option<String>,
}

pub struct Config {
    pub bind_addr: String,
    pub database: Option<PathBuf>,
    pub log_filter: String,
    pub relay: RelayConfig,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, ConfigError> {
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    fn resolve(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = cli
            .bind
            .or_else(|| env("SPOKE_BIND"))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let database = cli
            .database
            .or_else(|| env("SPOKE_DATABASE").map(PathBuf::from));

        let log_filter = cli
            .log
            .or_else(|| env("SPOKE_LOG"))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let ack_timeout = match cli.ack_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => match env("SPOKE_ACK_TIMEOUT_SECS") {
                Some(value) => Duration::from_secs(value.parse().map_err(|_| {
                    ConfigError::InvalidValue {
                        key: "SPOKE_ACK_TIMEOUT_SECS",
                        value,
                    }
                })?),
                None => DEFAULT_ACK_TIMEOUT,
            },
        };

        let replay_policy = match cli.replay_policy {
            Some(policy) => policy,
            None => match env("SPOKE_REPLAY_POLICY") {
                Some(value) => ReplayPolicy::from_str(&value, true).map_err(|_| {
                    ConfigError::InvalidValue {
                        key: "SPOKE_REPLAY_POLICY",
                        value,
                    }
                })?,
                None => ReplayPolicy::default(),
            },
        };

        Ok(Self {
            bind_addr,
            database,
            log_filter,
            relay: RelayConfig {
                ack_timeout,
                replay_policy,
                ..RelayConfig::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_cli_or_env() {
        let config = Config::resolve(Cli::default(), env_of(&[])).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND);
        assert!(config.database.is_none());
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.relay.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.relay.replay_policy, ReplayPolicy::AwaitAck);
        assert_eq!(config.relay.max_body_bytes, 512_000);
    }

    #[test]
    fn cli_beats_env() {
        let cli = Cli::parse_from([
            "spoke-relay",
            "--bind",
            "127.0.0.1:9000",
            "--replay-policy",
            "delete-on-send",
        ]);
        let env = env_of(&[
            ("SPOKE_BIND", "0.0.0.0:1"),
            ("SPOKE_REPLAY_POLICY", "await-ack"),
            ("SPOKE_ACK_TIMEOUT_SECS", "3"),
        ]);
        let config = Config::resolve(cli, env).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.relay.replay_policy, ReplayPolicy::DeleteOnSend);
        assert_eq!(config.relay.ack_timeout, Duration::from_secs(3));
    }

    #[test]
    fn bad_env_values_are_reported() {
        let err = Config::resolve(Cli::default(), env_of(&[("SPOKE_ACK_TIMEOUT_SECS", "soon")]))
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "SPOKE_ACK_TIMEOUT_SECS",
                value: "soon".into()
            }
        );
        assert!(
            Config::resolve(Cli::default(), env_of(&[("SPOKE_REPLAY_POLICY", "never")])).is_err()
        );
    }
}
