//! # patternserve
//!
//! A horizontally sharded cluster of pattern servers answering read-only
//! queries over precomputed per-project, per-model artifacts.
//!
//! ## Key Features
//!
//! - **Lease-based membership**: nodes register with a TTL lease and watch
//!   the peer set and the published metadata version
//! - **Deterministic sharding**: a node owns a key when the key hashes to its
//!   ordinal in the sorted peer list
//! - **3-Tier reads**: memory (LRU) → local disk → cloud bucket, with
//!   read-through backfill
//! - **Fan-out client**: every query is broadcast to all peers and the owning
//!   node's answer is merged
//!
//! ## Architecture
//!
//! - **cluster**: membership providers, shard assignment and the supervisor
//!   loop that keeps the node state current
//! - **store**: tiered artifact store
//! - **api**: ownership-aware RPC responders and status endpoints
//! - **client**: broadcast client over the RPC surface

pub mod api;
pub mod client;
pub mod cluster;
pub mod config;
pub mod metadata;
pub mod schema;
pub mod store;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Supported object storage providers for the cloud tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Memory,
    /// A local directory standing in for a bucket
    Local,
    Aws,
    Gcp,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" | "file" => Ok(Self::Local),
            "aws" | "s3" => Ok(Self::Aws),
            "gcp" | "gcs" => Ok(Self::Gcp),
            other => Err(format!(
                "unknown cloud provider '{}'; expected one of memory, local, aws, gcp",
                other
            )),
        }
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::api::PatternService;
    pub use crate::client::{ClientConfig, Gathered, PatternClient, PeerDirectory};
    pub use crate::cluster::{
        MembershipProvider, NodeIdentity, NodeState, PartitionScheme, Supervisor, SupervisorConfig,
    };
    pub use crate::config::{ComponentFactory, ServerConfig};
    pub use crate::store::{PatternStore, StoreConfig};
    pub use crate::{CloudProvider, Error, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_provider_parsing() {
        assert_eq!("S3".parse::<CloudProvider>().unwrap(), CloudProvider::Aws);
        assert_eq!("local".parse::<CloudProvider>().unwrap(), CloudProvider::Local);
        assert!("azure".parse::<CloudProvider>().is_err());
        assert_eq!(CloudProvider::Gcp.to_string(), "gcp");
    }
}
