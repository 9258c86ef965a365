//! Live peer address list for the fan-out client

use crate::cluster::{MembershipProvider, NodeIdentity};

use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared, cheaply cloneable list of peer RPC addresses
#[derive(Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<Vec<NodeIdentity>>>,
}

impl PeerDirectory {
    pub fn from_static(peers: Vec<NodeIdentity>) -> Self {
        let directory = Self::default();
        directory.replace(peers);
        directory
    }

    pub fn replace(&self, mut peers: Vec<NodeIdentity>) {
        peers.sort();
        peers.dedup();
        *self.peers.write() = peers;
    }

    pub fn peers(&self) -> Vec<NodeIdentity> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Keep the directory in step with the membership provider's peer watch.
    /// The task ends when the watch does.
    pub fn follow(&self, membership: Arc<dyn MembershipProvider>) -> JoinHandle<()> {
        let directory = self.clone();
        tokio::spawn(async move {
            let mut updates = membership.watch_peers();
            while let Some(update) = updates.next().await {
                match update {
                    Ok(peers) => {
                        info!(peer_count = peers.len(), "Peer directory updated");
                        directory.replace(peers);
                    }
                    Err(e) => {
                        warn!(error = %e, "Peer watch failed, directory frozen");
                        break;
                    }
                }
            }
        })
    }
}
