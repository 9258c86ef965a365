//! Cluster coordination for pattern servers
//!
//! Nodes register under a lease, agree on ordinals from the shared peer set
//! and serve only the keys their ordinal owns.

pub mod local;
pub mod membership;
pub mod node_state;
pub mod object_store;
pub mod shard_assignment;
pub mod supervisor;

pub use local::LocalMembership;
pub use membership::{Lease, LeaseKeepAlive, MembershipProvider, NodeIdentity};
pub use node_state::{NodeState, NodeStateHandle, NodeStateView};
pub use object_store::ObjectStoreMembership;
pub use shard_assignment::{compute_ordinal, is_servable, PartitionScheme, ShardAssignment};
pub use supervisor::{Supervisor, SupervisorConfig, INITIAL_METADATA_VERSION};
