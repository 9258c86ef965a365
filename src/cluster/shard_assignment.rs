//! Shard ownership
//!
//! A node's ordinal is its position in the sorted peer set. Every node that
//! observes the same peer set computes the same ordinals, so ownership of a
//! (project, model) key needs no coordination beyond membership.

use super::membership::{normalize_peers, NodeIdentity};

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// How keys are partitioned across ordinals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionScheme {
    /// `project_id mod n`; a project's models all live on one node
    #[default]
    Project,
    /// `crc32("pid:mid") mod n`; models of one project spread across nodes
    ProjectModel,
}

impl PartitionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::ProjectModel => "project-model",
        }
    }
}

impl FromStr for PartitionScheme {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "project" => Ok(Self::Project),
            "project-model" | "project_model" => Ok(Self::ProjectModel),
            other => Err(format!(
                "unknown partition scheme '{}'; expected project or project-model",
                other
            )),
        }
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of `me` in the sorted, de-duplicated peer set, or `None` when
/// `me` is not registered
pub fn compute_ordinal(me: &NodeIdentity, peers: &[NodeIdentity]) -> Option<usize> {
    let mut sorted: Vec<&NodeIdentity> = peers.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted.iter().position(|peer| *peer == me)
}

/// Ordinal owning a key among `peer_count` nodes
pub fn owner_ordinal(
    scheme: PartitionScheme,
    peer_count: usize,
    project_id: u64,
    model_id: u64,
) -> Option<usize> {
    if peer_count == 0 {
        return None;
    }
    let n = peer_count as u64;
    let slot = match scheme {
        PartitionScheme::Project => project_id % n,
        PartitionScheme::ProjectModel => {
            let key = format!("{}:{}", project_id, model_id);
            u64::from(crc32fast::hash(key.as_bytes())) % n
        }
    };
    Some(slot as usize)
}

/// Whether the node at `ordinal` owns the key
pub fn is_servable(
    scheme: PartitionScheme,
    ordinal: usize,
    peer_count: usize,
    project_id: u64,
    model_id: u64,
) -> bool {
    owner_ordinal(scheme, peer_count, project_id, model_id) == Some(ordinal)
}

/// A node's ordinal within a peer set of known size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardAssignment {
    pub scheme: PartitionScheme,
    pub ordinal: Option<usize>,
    pub peer_count: usize,
}

impl ShardAssignment {
    pub fn new(scheme: PartitionScheme, me: &NodeIdentity, peers: &[NodeIdentity]) -> Self {
        let peers = normalize_peers(peers.to_vec());
        Self {
            scheme,
            ordinal: peers.iter().position(|peer| peer == me),
            peer_count: peers.len(),
        }
    }

    /// Whether this node owns the key. A node without an ordinal owns nothing.
    pub fn is_servable(&self, project_id: u64, model_id: u64) -> bool {
        match self.ordinal {
            Some(ordinal) => {
                is_servable(self.scheme, ordinal, self.peer_count, project_id, model_id)
            }
            None => false,
        }
    }
}
