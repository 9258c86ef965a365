//! Cluster membership
//!
//! Each pattern server registers its identity under a lease with a
//! coordination service, renews that lease for as long as it serves, and
//! watches the registered peer set and the metadata version pointer.
//! [`MembershipProvider`] abstracts the coordination service.

use crate::{Error, Result};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Address and RPC port of a pattern server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub address: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// Peers are ordered by their `address:port` form, which every node derives
// the same way regardless of how the coordinator lists them.
impl Ord for NodeIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for NodeIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for NodeIdentity {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let (address, port) = value
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("missing port in '{}'", value)))?;
        if address.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "missing address in '{}'",
                value
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidArgument(format!("invalid port in '{}'", value)))?;
        Ok(Self::new(address, port))
    }
}

/// A granted registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: u64,
    pub ttl: Duration,
    pub identity: NodeIdentity,
}

/// Acknowledgement of one lease renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseKeepAlive {
    pub lease_id: u64,
    pub ttl: Duration,
}

/// Coordination service used for membership and the metadata version pointer
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Register `identity` under a new lease. Fails with
    /// [`Error::AlreadyRegistered`] if the identity already holds a live
    /// registration.
    async fn register(&self, identity: &NodeIdentity, ttl: Duration) -> Result<Lease>;

    /// Renew `lease` until the stream is dropped. The stream yields one item
    /// per renewal; an error item means the lease is gone and the stream ends.
    fn keep_alive(&self, lease: &Lease) -> BoxStream<'static, Result<LeaseKeepAlive>>;

    /// Release a registration ahead of its expiry
    async fn revoke(&self, lease: &Lease) -> Result<()>;

    /// Live registrations sorted by `address:port`
    async fn discover_peers(&self) -> Result<Vec<NodeIdentity>>;

    /// Emits the current sorted peer set, then again whenever it changes
    fn watch_peers(&self) -> BoxStream<'static, Result<Vec<NodeIdentity>>>;

    /// Current metadata version, if one has been published
    async fn get_metadata_version(&self) -> Result<Option<String>>;

    async fn set_metadata_version(&self, version: &str) -> Result<()>;

    /// Emits the current metadata version once one is published, then each
    /// change
    fn watch_metadata_version(&self) -> BoxStream<'static, Result<String>>;
}

/// Sort and de-duplicate a peer listing
pub fn normalize_peers(mut peers: Vec<NodeIdentity>) -> Vec<NodeIdentity> {
    peers.sort();
    peers.dedup();
    peers
}
