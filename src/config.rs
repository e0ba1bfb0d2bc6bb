//! Environment-based configuration
//!
//! Every setting has a default suitable for a single-node development
//! cluster; `Config::from_env` overlays `TIDEMARK_*` variables.

use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub meta: MetaConfig,
    pub coordinator: CoordinatorConfig,
}

/// Metadata store configuration
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Directory for the consensus log, snapshots and node identity.
    /// `None` keeps everything in memory.
    pub dir: Option<PathBuf>,
    /// Cluster TCP address shared by consensus and cluster RPC.
    pub bind_address: String,
    /// HTTP API address
    pub http_bind_address: String,
    /// HTTP addresses of existing meta nodes to join
    pub join_peers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    /// Per-attempt bound on a consensus apply
    pub apply_timeout: Duration,
    /// Backoff between `SetMetaNode` attempts while opening a sole member
    pub commit_retry_interval: Duration,
    /// Leader wait during open; zero waits forever
    pub leader_wait_timeout: Duration,
    pub logging_enabled: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            dir: None,
            bind_address: "127.0.0.1:8088".to_string(),
            http_bind_address: "127.0.0.1:8091".to_string(),
            join_peers: Vec::new(),
            heartbeat_interval: Duration::from_millis(500),
            election_timeout: Duration::from_millis(1500),
            apply_timeout: Duration::from_secs(10),
            commit_retry_interval: Duration::from_millis(100),
            leader_wait_timeout: Duration::ZERO,
            logging_enabled: true,
        }
    }
}

/// How the shard mapper treats failures to create a missing local shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePolicy {
    /// Continue silently
    Ignore,
    /// Log at warn level, count, and continue
    Warn,
    /// Fail the mapping
    Fail,
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "warn" => Ok(Self::Warn),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "unknown reconcile policy '{}'; expected one of ignore, warn, fail",
                other
            )),
        }
    }
}

/// Query routing and write forwarding configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline for one forwarded shard write
    pub shard_writer_timeout: Duration,
    /// Outstanding connections per destination node
    pub max_remote_write_connections: usize,
    /// How long a write waits for a free pooled connection; zero fails fast
    pub pool_wait_timeout: Duration,
    /// Connection deadline used when dialing remote iterators
    pub dial_timeout: Duration,
    /// Lower clamp applied to iterator time ranges (nanoseconds)
    pub shard_mapper_min_time: Option<i64>,
    /// Upper clamp applied to iterator time ranges (nanoseconds)
    pub shard_mapper_max_time: Option<i64>,
    pub reconcile_policy: ReconcilePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard_writer_timeout: Duration::from_secs(5),
            max_remote_write_connections: 3,
            pool_wait_timeout: Duration::ZERO,
            dial_timeout: Duration::from_secs(3),
            shard_mapper_min_time: None,
            shard_mapper_max_time: None,
            reconcile_policy: ReconcilePolicy::Warn,
        }
    }
}

impl Config {
    /// Load configuration from the environment
    ///
    /// Environment variables:
    /// - TIDEMARK_META_DIR: data directory (default: in-memory)
    /// - TIDEMARK_BIND_ADDRESS: cluster TCP address (default: 127.0.0.1:8088)
    /// - TIDEMARK_HTTP_BIND_ADDRESS: meta HTTP address (default: 127.0.0.1:8091)
    /// - TIDEMARK_JOIN: comma separated peer HTTP addresses
    /// - TIDEMARK_HEARTBEAT_INTERVAL, TIDEMARK_ELECTION_TIMEOUT, TIDEMARK_APPLY_TIMEOUT,
    ///   TIDEMARK_LEADER_WAIT_TIMEOUT: durations such as `500ms`, `10s`
    /// - TIDEMARK_SHARD_WRITER_TIMEOUT, TIDEMARK_POOL_WAIT_TIMEOUT, TIDEMARK_DIAL_TIMEOUT
    /// - TIDEMARK_MAX_REMOTE_WRITE_CONNECTIONS
    /// - TIDEMARK_SHARD_MAPPER_MIN_TIME, TIDEMARK_SHARD_MAPPER_MAX_TIME: nanoseconds
    /// - TIDEMARK_RECONCILE_POLICY: ignore, warn (default) or fail
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        let meta = &mut config.meta;

        if let Some(dir) = env_string("TIDEMARK_META_DIR") {
            meta.dir = Some(PathBuf::from(dir));
        }
        if let Some(addr) = env_string("TIDEMARK_BIND_ADDRESS") {
            meta.bind_address = addr;
        }
        if let Some(addr) = env_string("TIDEMARK_HTTP_BIND_ADDRESS") {
            meta.http_bind_address = addr;
        }
        if let Some(peers) = env_string("TIDEMARK_JOIN") {
            meta.join_peers = parse_peers(&peers);
        }
        if let Some(d) = env_duration("TIDEMARK_HEARTBEAT_INTERVAL")? {
            meta.heartbeat_interval = d;
        }
        if let Some(d) = env_duration("TIDEMARK_ELECTION_TIMEOUT")? {
            meta.election_timeout = d;
        }
        if let Some(d) = env_duration("TIDEMARK_APPLY_TIMEOUT")? {
            meta.apply_timeout = d;
        }
        if let Some(d) = env_duration("TIDEMARK_LEADER_WAIT_TIMEOUT")? {
            meta.leader_wait_timeout = d;
        }
        if let Some(v) = env_string("TIDEMARK_META_LOGGING_ENABLED") {
            meta.logging_enabled = parse_bool("TIDEMARK_META_LOGGING_ENABLED", &v)?;
        }

        let coord = &mut config.coordinator;
        if let Some(d) = env_duration("TIDEMARK_SHARD_WRITER_TIMEOUT")? {
            coord.shard_writer_timeout = d;
        }
        if let Some(d) = env_duration("TIDEMARK_POOL_WAIT_TIMEOUT")? {
            coord.pool_wait_timeout = d;
        }
        if let Some(d) = env_duration("TIDEMARK_DIAL_TIMEOUT")? {
            coord.dial_timeout = d;
        }
        if let Some(v) = env_string("TIDEMARK_MAX_REMOTE_WRITE_CONNECTIONS") {
            coord.max_remote_write_connections = v.parse().map_err(|e| {
                Error::Config(format!("TIDEMARK_MAX_REMOTE_WRITE_CONNECTIONS: {e}"))
            })?;
        }
        if let Some(v) = env_string("TIDEMARK_SHARD_MAPPER_MIN_TIME") {
            coord.shard_mapper_min_time = Some(v.parse().map_err(|e| {
                Error::Config(format!("TIDEMARK_SHARD_MAPPER_MIN_TIME: {e}"))
            })?);
        }
        if let Some(v) = env_string("TIDEMARK_SHARD_MAPPER_MAX_TIME") {
            coord.shard_mapper_max_time = Some(v.parse().map_err(|e| {
                Error::Config(format!("TIDEMARK_SHARD_MAPPER_MAX_TIME: {e}"))
            })?);
        }
        if let Some(v) = env_string("TIDEMARK_RECONCILE_POLICY") {
            coord.reconcile_policy = v.parse().map_err(Error::Config)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.max_remote_write_connections == 0 {
            return Err(Error::Config(
                "max_remote_write_connections must be at least 1".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (
            self.coordinator.shard_mapper_min_time,
            self.coordinator.shard_mapper_max_time,
        ) {
            if min > max {
                return Err(Error::Config(format!(
                    "shard mapper min time {} is after max time {}",
                    min, max
                )));
            }
        }
        if self.meta.heartbeat_interval >= self.meta.election_timeout {
            return Err(Error::Config(
                "heartbeat interval must be shorter than election timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a comma separated peer list, dropping blanks.
pub fn parse_peers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    match env_string(name) {
        Some(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}: invalid duration '{raw}': {e}"))),
        None => Ok(None),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name} must be a boolean, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_duration_uses_humantime_units() {
        std::env::set_var("TIDEMARK_TEST_DURATION_UNITS", "1m 30s");
        assert_eq!(
            env_duration("TIDEMARK_TEST_DURATION_UNITS").unwrap(),
            Some(Duration::from_secs(90))
        );
        std::env::set_var("TIDEMARK_TEST_DURATION_UNITS", "250ms");
        assert_eq!(
            env_duration("TIDEMARK_TEST_DURATION_UNITS").unwrap(),
            Some(Duration::from_millis(250))
        );
        std::env::remove_var("TIDEMARK_TEST_DURATION_UNITS");
        assert_eq!(env_duration("TIDEMARK_TEST_DURATION_UNITS").unwrap(), None);
    }

    #[test]
    fn env_duration_rejects_overflow_and_garbage() {
        std::env::set_var("TIDEMARK_TEST_DURATION_BAD", "5124095576030432h");
        assert!(matches!(
            env_duration("TIDEMARK_TEST_DURATION_BAD"),
            Err(Error::Config(_))
        ));
        std::env::set_var("TIDEMARK_TEST_DURATION_BAD", "ms");
        assert!(env_duration("TIDEMARK_TEST_DURATION_BAD").is_err());
        std::env::remove_var("TIDEMARK_TEST_DURATION_BAD");
    }

    #[test]
    fn parse_peers_drops_blanks() {
        assert_eq!(
            parse_peers("a:8091, ,b:8091,"),
            vec!["a:8091".to_string(), "b:8091".to_string()]
        );
    }

    #[test]
    fn reconcile_policy_from_str() {
        assert_eq!("WARN".parse::<ReconcilePolicy>(), Ok(ReconcilePolicy::Warn));
        assert_eq!("fail".parse::<ReconcilePolicy>(), Ok(ReconcilePolicy::Fail));
        assert!("retry".parse::<ReconcilePolicy>().is_err());
    }

    #[test]
    fn validate_rejects_inverted_clamp() {
        let mut config = Config::default();
        config.coordinator.shard_mapper_min_time = Some(10);
        config.coordinator.shard_mapper_max_time = Some(5);
        assert!(config.validate().is_err());

        config.coordinator.shard_mapper_max_time = Some(50);
        assert!(config.validate().is_ok());
    }
}
