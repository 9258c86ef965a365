//! Error types for patternserve

use std::fmt;

/// Result type alias for patternserve operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for patternserve
#[derive(Debug)]
pub enum Error {
    /// Object store errors (disk and cloud tiers)
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Identity already holds a live registration
    AlreadyRegistered(String),
    /// Identity is not part of the current peer set
    NotRegistered(String),
    /// Lease expired or was revoked before it could be renewed
    LeaseExpired(u64),
    /// A coordination watch or keep-alive stream terminated
    WatchClosed(String),
    /// Missing or malformed request argument
    InvalidArgument(String),
    /// Key absent from every storage tier
    NotFound(String),
    /// A single stored record exceeded the scanner capacity
    RecordTooLarge { path: String, limit: usize },
    /// Remote procedure call failure
    Rpc(String),
    /// HTTP transport errors
    Http(reqwest::Error),
    /// Timeout
    Timeout,
    /// Metadata conflict (CAS failure)
    Conflict,
    /// Internal error
    Internal(String),
}

impl Error {
    /// True for errors that mean this node can no longer trust its slot in
    /// the cluster and must stop serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AlreadyRegistered(_)
                | Error::NotRegistered(_)
                | Error::LeaseExpired(_)
                | Error::WatchClosed(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::AlreadyRegistered(id) => {
                write!(f, "Pattern server already registered with {}", id)
            }
            Error::NotRegistered(id) => write!(f, "Pattern server {} is not registered", id),
            Error::LeaseExpired(lease_id) => write!(f, "Lease {} expired", lease_id),
            Error::WatchClosed(what) => write!(f, "Watch channel closed: {}", what),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotFound(key) => write!(f, "Not found: {}", key),
            Error::RecordTooLarge { path, limit } => {
                write!(f, "Record in {} exceeds {} bytes", path, limit)
            }
            Error::Rpc(msg) => write!(f, "RPC error: {}", msg),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Conflict => write!(f, "Conflict: concurrent modification detected"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            other => Error::ObjectStore(other),
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
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(e)
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
