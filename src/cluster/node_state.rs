//! Node state snapshot
//!
//! Everything a serving node needs to decide ownership lives in one immutable
//! [`NodeState`]. The reactive loop is the only writer; it builds a new
//! snapshot and swaps it in through a watch channel, so readers always see a
//! consistent (ordinal, peers, catalog) triple.

use super::membership::{normalize_peers, NodeIdentity};
use super::shard_assignment::{PartitionScheme, ShardAssignment};
use crate::metadata::{ModelData, ProjectCatalog};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct NodeState {
    pub identity: NodeIdentity,
    pub scheme: PartitionScheme,
    /// Position in `peers`, `None` when this node is not registered
    pub ordinal: Option<usize>,
    /// Sorted, de-duplicated peer set
    pub peers: Vec<NodeIdentity>,
    pub metadata_version: String,
    pub catalog: Arc<ProjectCatalog>,
    pub updated_at: DateTime<Utc>,
}

impl NodeState {
    pub fn new(
        identity: NodeIdentity,
        scheme: PartitionScheme,
        peers: Vec<NodeIdentity>,
        metadata_version: impl Into<String>,
        catalog: Arc<ProjectCatalog>,
    ) -> Self {
        let peers = normalize_peers(peers);
        let ordinal = peers.iter().position(|peer| *peer == identity);
        Self {
            identity,
            scheme,
            ordinal,
            peers,
            metadata_version: metadata_version.into(),
            catalog,
            updated_at: Utc::now(),
        }
    }

    /// Copy of this state with a new peer set (and recomputed ordinal)
    pub fn with_peers(&self, peers: Vec<NodeIdentity>) -> Self {
        Self::new(
            self.identity.clone(),
            self.scheme,
            peers,
            self.metadata_version.clone(),
            self.catalog.clone(),
        )
    }

    /// Copy of this state serving another catalog version
    pub fn with_catalog(&self, version: impl Into<String>, catalog: Arc<ProjectCatalog>) -> Self {
        Self::new(
            self.identity.clone(),
            self.scheme,
            self.peers.clone(),
            version,
            catalog,
        )
    }

    pub fn assignment(&self) -> ShardAssignment {
        ShardAssignment {
            scheme: self.scheme,
            ordinal: self.ordinal,
            peer_count: self.peers.len(),
        }
    }

    pub fn is_servable(&self, project_id: u64, model_id: u64) -> bool {
        self.assignment().is_servable(project_id, model_id)
    }

    /// Latest model of a project known to this node
    pub fn latest_model(&self, project_id: u64) -> Option<(u64, &ModelData)> {
        self.catalog.latest_model(project_id)
    }

    pub fn view(&self) -> NodeStateView<'_> {
        NodeStateView {
            identity: self.identity.to_string(),
            scheme: self.scheme,
            ordinal: self.ordinal,
            peers: self.peers.iter().map(ToString::to_string).collect(),
            metadata_version: &self.metadata_version,
            catalog: &self.catalog,
            updated_at: self.updated_at,
        }
    }
}

/// JSON form of a [`NodeState`] for the status endpoint
#[derive(Debug, Serialize)]
pub struct NodeStateView<'a> {
    pub identity: String,
    pub scheme: PartitionScheme,
    pub ordinal: Option<usize>,
    pub peers: Vec<String>,
    pub metadata_version: &'a str,
    pub catalog: &'a ProjectCatalog,
    pub updated_at: DateTime<Utc>,
}

/// Single-writer handle publishing node state snapshots
#[derive(Clone)]
pub struct NodeStateHandle {
    tx: Arc<watch::Sender<Arc<NodeState>>>,
}

impl NodeStateHandle {
    pub fn new(initial: NodeState) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<NodeState> {
        self.tx.borrow().clone()
    }

    /// Swap in a new snapshot
    pub fn replace(&self, state: NodeState) -> Arc<NodeState> {
        let state = Arc::new(state);
        self.tx.send_replace(state.clone());
        state
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<NodeState>> {
        self.tx.subscribe()
    }
}
