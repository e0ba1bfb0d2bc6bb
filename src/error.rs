//! Error types for Tidemark

use std::fmt;

/// Result type alias for Tidemark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Tidemark
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// HTTP client errors
    Http(String),
    /// Internal error
    Internal(String),

    /// Meta store opened twice
    StoreAlreadyOpen,
    /// Meta store has not completed `open`
    NotOpen,
    /// This node cannot commit; `leader` is the leader's HTTP address when known
    NotLeader { leader: Option<String> },
    /// Node is not present in the topology
    NodeNotFound,
    /// Node with the same address already registered
    NodeExists,
    /// Node is still visible in the topology after removal
    UnableToDropNode,
    /// Attempt to remove the current leader
    CannotRemoveLeader,
    /// Leader election wait timed out
    Timeout,
    /// Store closed while waiting
    Closing,
    /// Cluster join attempted without peers
    EmptyPeers,
    /// Database not found
    DatabaseNotFound(String),
    /// Retention policy not found
    RetentionPolicyNotFound(String),
    /// Retention policy exists with different settings
    RetentionPolicyConflict(String),
    /// Committed command rejected by the state machine
    Command(String),
    /// Consensus engine failure
    Consensus(String),

    /// Shard not present in the local store
    ShardNotFound(u64),

    /// Failed to dial a remote node
    Dial { addr: String, reason: String },
    /// Read or write deadline exceeded
    IoTimeout(String),
    /// Remote node reported an error
    Remote(String),
    /// Remote node rejected a shard write
    RemoteWrite { code: u8, message: String },
    /// Caller cancelled the operation
    Cancelled,
    /// No free connection in the shard writer pool
    PoolExhausted,
}

impl Error {
    /// True for read/write deadline failures, as opposed to remote rejections.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::IoTimeout(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Http(msg) => write!(f, "HTTP error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::StoreAlreadyOpen => write!(f, "meta store already open"),
            Error::NotOpen => write!(f, "meta store not open"),
            Error::NotLeader { leader: Some(leader) } => {
                write!(f, "node is not the leader; leader is {}", leader)
            }
            Error::NotLeader { leader: None } => write!(f, "node is not the leader"),
            Error::NodeNotFound => write!(f, "node not found"),
            Error::NodeExists => write!(f, "node already exists"),
            Error::UnableToDropNode => write!(f, "unable to drop node"),
            Error::CannotRemoveLeader => write!(f, "can't remove leader node"),
            Error::Timeout => write!(f, "timeout waiting for leader"),
            Error::Closing => write!(f, "meta store closing"),
            Error::EmptyPeers => write!(f, "empty peers"),
            Error::DatabaseNotFound(name) => write!(f, "database not found: {}", name),
            Error::RetentionPolicyNotFound(name) => {
                write!(f, "retention policy not found: {}", name)
            }
            Error::RetentionPolicyConflict(name) => {
                write!(f, "retention policy conflicts with an existing policy: {}", name)
            }
            Error::Command(msg) => write!(f, "command rejected: {}", msg),
            Error::Consensus(msg) => write!(f, "consensus error: {}", msg),
            Error::ShardNotFound(id) => write!(f, "shard not found: {}", id),
            Error::Dial { addr, reason } => write!(f, "dial {}: {}", addr, reason),
            Error::IoTimeout(op) => write!(f, "i/o timeout: {}", op),
            Error::Remote(msg) => write!(f, "remote error: {}", msg),
            Error::RemoteWrite { code, message } => {
                write!(f, "error code {}: {}", code, message)
            }
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::PoolExhausted => write!(f, "timed out waiting for free connection"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Config(format!("invalid regex: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_write_error_carries_code() {
        let err = Error::RemoteWrite {
            code: 1,
            message: "write shard 1: failed to write".to_string(),
        };
        assert_eq!(err.to_string(), "error code 1: write shard 1: failed to write");
        assert!(!err.is_timeout());
    }

    #[test]
    fn io_timeout_is_distinguishable() {
        assert!(Error::IoTimeout("write".to_string()).is_timeout());
        assert!(Error::IoTimeout("read".to_string()).to_string().contains("i/o timeout"));
        assert!(!Error::PoolExhausted.is_timeout());
    }
}
