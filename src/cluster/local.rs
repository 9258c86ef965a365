//! In-process membership coordinator
//!
//! Used in development mode and tests: every node sharing a
//! [`LocalMembership`] (it is cheap to clone) sees the same registrations.
//! Lease expiry follows the tokio clock, so a paused test runtime can expire
//! leases by advancing time.

use super::membership::{Lease, LeaseKeepAlive, MembershipProvider, NodeIdentity};
use crate::{Error, Result};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often peer watchers check for expired leases
const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Registration {
    lease_id: u64,
    ttl: Duration,
    expires_at: Instant,
}

struct Inner {
    registrations: RwLock<BTreeMap<NodeIdentity, Registration>>,
    next_lease_id: AtomicU64,
    peers: watch::Sender<Vec<NodeIdentity>>,
    version: watch::Sender<Option<String>>,
}

impl Inner {
    /// Publish the current peer set if it differs from the last one
    fn publish_peers(&self, registrations: &BTreeMap<NodeIdentity, Registration>) {
        let current: Vec<NodeIdentity> = registrations.keys().cloned().collect();
        self.peers.send_if_modified(|peers| {
            if *peers == current {
                false
            } else {
                *peers = current;
                true
            }
        });
    }

    /// Drop registrations whose lease has run out
    fn scavenge(&self) {
        let now = Instant::now();
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|identity, registration| {
            let live = registration.expires_at > now;
            if !live {
                warn!(node = %identity, lease_id = registration.lease_id, "Lease expired");
            }
            live
        });
        if registrations.len() != before {
            self.publish_peers(&registrations);
        }
    }

    fn renew(&self, lease: &Lease) -> Result<LeaseKeepAlive> {
        let now = Instant::now();
        let mut registrations = self.registrations.write();
        match registrations.get_mut(&lease.identity) {
            Some(registration)
                if registration.lease_id == lease.id && registration.expires_at > now =>
            {
                registration.expires_at = now + registration.ttl;
                Ok(LeaseKeepAlive {
                    lease_id: lease.id,
                    ttl: registration.ttl,
                })
            }
            _ => Err(Error::LeaseExpired(lease.id)),
        }
    }
}

/// Membership coordinator living in this process
#[derive(Clone)]
pub struct LocalMembership {
    inner: Arc<Inner>,
}

impl Default for LocalMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMembership {
    pub fn new() -> Self {
        let (peers, _) = watch::channel(Vec::new());
        let (version, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                registrations: RwLock::new(BTreeMap::new()),
                next_lease_id: AtomicU64::new(1),
                peers,
                version,
            }),
        }
    }
}

#[async_trait]
impl MembershipProvider for LocalMembership {
    async fn register(&self, identity: &NodeIdentity, ttl: Duration) -> Result<Lease> {
        self.inner.scavenge();

        let mut registrations = self.inner.registrations.write();
        if registrations.contains_key(identity) {
            return Err(Error::AlreadyRegistered(identity.to_string()));
        }

        let lease_id = self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed);
        registrations.insert(
            identity.clone(),
            Registration {
                lease_id,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        self.inner.publish_peers(&registrations);

        info!(node = %identity, lease_id, ttl_secs = ttl.as_secs(), "Registered node");
        Ok(Lease {
            id: lease_id,
            ttl,
            identity: identity.clone(),
        })
    }

    fn keep_alive(&self, lease: &Lease) -> BoxStream<'static, Result<LeaseKeepAlive>> {
        let mut interval = tokio::time::interval((lease.ttl / 3).max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let state = Some((self.inner.clone(), lease.clone(), interval));
        stream::unfold(state, |state| async move {
            let (inner, lease, mut interval) = state?;
            interval.tick().await;
            match inner.renew(&lease) {
                Ok(ack) => {
                    debug!(lease_id = ack.lease_id, "Renewed lease");
                    Some((Ok(ack), Some((inner, lease, interval))))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    async fn revoke(&self, lease: &Lease) -> Result<()> {
        let mut registrations = self.inner.registrations.write();
        let owned = registrations
            .get(&lease.identity)
            .is_some_and(|registration| registration.lease_id == lease.id);
        if owned {
            registrations.remove(&lease.identity);
            self.inner.publish_peers(&registrations);
            info!(node = %lease.identity, lease_id = lease.id, "Revoked lease");
        }
        Ok(())
    }

    async fn discover_peers(&self) -> Result<Vec<NodeIdentity>> {
        self.inner.scavenge();
        Ok(self.inner.registrations.read().keys().cloned().collect())
    }

    fn watch_peers(&self) -> BoxStream<'static, Result<Vec<NodeIdentity>>> {
        let rx = self.inner.peers.subscribe();

        // The first item is the current peer set.
        let state = Some((self.inner.clone(), rx, true));
        stream::unfold(state, |state| async move {
            let (inner, mut rx, first) = state?;
            if first {
                let peers = rx.borrow_and_update().clone();
                return Some((Ok(peers), Some((inner, rx, false))));
            }
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        return match changed {
                            Ok(()) => {
                                let peers = rx.borrow_and_update().clone();
                                Some((Ok(peers), Some((inner, rx, false))))
                            }
                            Err(_) => Some((Err(Error::WatchClosed("peers".to_string())), None)),
                        };
                    }
                    _ = tokio::time::sleep(EXPIRY_SCAN_INTERVAL) => inner.scavenge(),
                }
            }
        })
        .boxed()
    }

    async fn get_metadata_version(&self) -> Result<Option<String>> {
        Ok(self.inner.version.borrow().clone())
    }

    async fn set_metadata_version(&self, version: &str) -> Result<()> {
        let next = Some(version.to_string());
        self.inner.version.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        Ok(())
    }

    fn watch_metadata_version(&self) -> BoxStream<'static, Result<String>> {
        let mut rx = self.inner.version.subscribe();
        rx.mark_changed();

        stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            loop {
                if rx.changed().await.is_err() {
                    return Some((Err(Error::WatchClosed("metadata version".to_string())), None));
                }
                let version = rx.borrow_and_update().clone();
                if let Some(version) = version {
                    return Some((Ok(version), Some(rx)));
                }
            }
        })
        .boxed()
    }
}
