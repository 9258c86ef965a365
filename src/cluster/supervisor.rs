//! Reactive update loop
//!
//! [`Supervisor::start`] joins the cluster and builds the first node state.
//! [`Supervisor::run`] then keeps it current: it renews the lease, follows
//! the peer set and the metadata version, and re-derives the ordinal on a
//! timer in case a watch event was missed. Lease renewal runs in its own
//! task so a slow catalog load or peer scan never delays it. Losing the
//! lease, or a watch ending, stops the loop with an error; the node must not
//! keep serving with a slot it may no longer own.

use super::membership::{Lease, LeaseKeepAlive, MembershipProvider, NodeIdentity};
use super::node_state::{NodeState, NodeStateHandle};
use super::shard_assignment::PartitionScheme;
use crate::metadata::CatalogSource;
use crate::{Error, Result};

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Metadata version published when the coordinator has none yet
pub const INITIAL_METADATA_VERSION: &str = "version1";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub lease_ttl: Duration,
    pub reconcile_interval: Duration,
    pub initial_metadata_version: String,
    pub scheme: PartitionScheme,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(5 * 60),
            initial_metadata_version: INITIAL_METADATA_VERSION.to_string(),
            scheme: PartitionScheme::Project,
        }
    }
}

/// Owns this node's lease and is the single writer of its node state
pub struct Supervisor {
    membership: Arc<dyn MembershipProvider>,
    catalog: CatalogSource,
    config: SupervisorConfig,
    lease: Lease,
    state: NodeStateHandle,
}

impl Supervisor {
    /// Load the catalog, register, discover peers and derive the ordinal.
    /// Any failure here is fatal for the node.
    ///
    /// The catalog is loaded before registering: nothing renews the lease
    /// until [`Supervisor::run`] starts.
    pub async fn start(
        identity: NodeIdentity,
        membership: Arc<dyn MembershipProvider>,
        catalog: CatalogSource,
        config: SupervisorConfig,
    ) -> Result<Self> {
        let version = match membership.get_metadata_version().await? {
            Some(version) => version,
            None => {
                info!(
                    version = %config.initial_metadata_version,
                    "No metadata version published, setting initial version"
                );
                membership
                    .set_metadata_version(&config.initial_metadata_version)
                    .await?;
                config.initial_metadata_version.clone()
            }
        };

        let projects = catalog.load(&version).await?;

        let lease = membership.register(&identity, config.lease_ttl).await?;
        let peers = membership.discover_peers().await?;
        if !peers.contains(&identity) {
            return Err(Error::NotRegistered(identity.to_string()));
        }

        let state = NodeState::new(identity, config.scheme, peers, version, Arc::new(projects));
        info!(
            node = %state.identity,
            ordinal = ?state.ordinal,
            peers = state.peers.len(),
            version = %state.metadata_version,
            "Node joined cluster"
        );

        Ok(Self {
            membership,
            catalog,
            config,
            lease,
            state: NodeStateHandle::new(state),
        })
    }

    /// Handle for readers of the node state
    pub fn state(&self) -> NodeStateHandle {
        self.state.clone()
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Run until `shutdown` flips to true (revoking the lease) or a fatal
    /// error occurs.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (lease_lost_tx, lease_lost) = oneshot::channel();
        let renewer = tokio::spawn(renew_lease(
            self.membership.keep_alive(&self.lease),
            lease_lost_tx,
        ));

        let result = self.follow(shutdown, lease_lost, &renewer).await;
        renewer.abort();
        result
    }

    async fn follow(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut lease_lost: oneshot::Receiver<Error>,
        renewer: &JoinHandle<()>,
    ) -> Result<()> {
        let mut peer_events = self.membership.watch_peers();
        let mut version_events = self.membership.watch_metadata_version();

        let period = self.config.reconcile_interval;
        let mut reconcile = interval_at(Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                lost = &mut lease_lost => {
                    return Err(lost.unwrap_or_else(|_| Error::WatchClosed("keep-alive".to_string())));
                }
                event = peer_events.next() => match event {
                    Some(Ok(peers)) => self.apply_peers(peers),
                    Some(Err(e)) => {
                        error!(error = %e, "Peer watch failed");
                        return Err(e);
                    }
                    None => return Err(Error::WatchClosed("peers".to_string())),
                },
                event = version_events.next() => match event {
                    Some(Ok(version)) => self.apply_version(&version).await,
                    Some(Err(e)) => {
                        error!(error = %e, "Metadata version watch failed");
                        return Err(e);
                    }
                    None => return Err(Error::WatchClosed("metadata version".to_string())),
                },
                _ = reconcile.tick() => self.reconcile().await?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(node = %self.lease.identity, "Shutting down, revoking lease");
                        renewer.abort();
                        if let Err(e) = self.membership.revoke(&self.lease).await {
                            warn!(error = %e, "Failed to revoke lease");
                        }
                        return Ok(());
                    }
                }
            }
        }
    }

    fn apply_peers(&self, peers: Vec<NodeIdentity>) {
        let current = self.state.snapshot();
        let next = current.with_peers(peers);
        if next.peers == current.peers {
            return;
        }

        if next.ordinal.is_none() {
            warn!(
                node = %next.identity,
                "Node missing from peer set, serving nothing until it reappears"
            );
        }
        info!(
            old_ordinal = ?current.ordinal,
            new_ordinal = ?next.ordinal,
            peers = next.peers.len(),
            "Peer set changed"
        );
        self.state.replace(next);
    }

    /// Load the catalog of `version`. On failure the current catalog stays in
    /// place and the next reconcile retries.
    async fn apply_version(&self, version: &str) {
        let current = self.state.snapshot();
        if current.metadata_version == version {
            return;
        }

        match self.catalog.load(version).await {
            Ok(projects) => {
                info!(
                    old_version = %current.metadata_version,
                    new_version = %version,
                    "Metadata version changed"
                );
                // Peers may have moved while the catalog was loading.
                let latest = self.state.snapshot();
                self.state
                    .replace(latest.with_catalog(version, Arc::new(projects)));
            }
            Err(e) => {
                warn!(version = %version, error = %e, "Failed to load catalog, keeping current");
            }
        }
    }

    /// Re-derive the state from the coordinator without waiting for events
    async fn reconcile(&self) -> Result<()> {
        debug!("Reconciling node state");

        match self.membership.discover_peers().await {
            Ok(peers) => {
                let current = self.state.snapshot();
                let next = current.with_peers(peers);
                if next.ordinal != current.ordinal || next.peers != current.peers {
                    warn!(
                        old_ordinal = ?current.ordinal,
                        new_ordinal = ?next.ordinal,
                        "Node state drifted from coordinator, rebalancing"
                    );
                    self.state.replace(next);
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "Peer discovery failed during reconcile"),
        }

        match self.membership.get_metadata_version().await {
            Ok(Some(version)) => self.apply_version(&version).await,
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "Metadata version read failed during reconcile"),
        }

        Ok(())
    }
}

/// Drive the keep-alive stream until it fails, reporting why on `lost`
async fn renew_lease(
    mut keep_alive: BoxStream<'static, Result<LeaseKeepAlive>>,
    lost: oneshot::Sender<Error>,
) {
    let reason = loop {
        match keep_alive.next().await {
            Some(Ok(ack)) => debug!(lease_id = ack.lease_id, "Lease renewed"),
            Some(Err(e)) => {
                error!(error = %e, "Lease keep-alive failed");
                break e;
            }
            None => {
                error!("Lease keep-alive stream ended");
                break Error::WatchClosed("keep-alive".to_string());
            }
        }
    };
    let _ = lost.send(reason);
}
