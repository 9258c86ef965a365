//! Membership coordinated through an object store
//!
//! Each node owns one registration object under `{prefix}/nodes/`. It is
//! created with a conditional create and renewed with an ETag
//! compare-and-swap, so two processes can never both hold the same identity.
//! Registrations carry a wall-clock `expires_at`; readers treat expired
//! records as absent. Watches poll and diff.

use super::membership::{
    normalize_peers, Lease, LeaseKeepAlive, MembershipProvider, NodeIdentity,
};
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Consecutive failed polls after which a watch gives up
const MAX_POLL_FAILURES: u32 = 5;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistrationRecord {
    identity: NodeIdentity,
    lease_id: u64,
    ttl_ms: u64,
    expires_at: DateTime<Utc>,
}

impl RegistrationRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Membership provider backed by conditional writes to an object store
#[derive(Clone)]
pub struct ObjectStoreMembership {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    poll_interval: Duration,
}

impl ObjectStoreMembership {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often watches poll the store
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn nodes_prefix(&self) -> Path {
        Path::from(format!("{}/nodes", self.prefix))
    }

    fn node_path(&self, identity: &NodeIdentity) -> Path {
        Path::from(format!("{}/nodes/{}", self.prefix, identity))
    }

    fn version_path(&self) -> Path {
        Path::from(format!("{}/metadata_version", self.prefix))
    }

    fn ticker(&self, period: Duration) -> Interval {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn load_record(
        &self,
        path: &Path,
    ) -> Result<Option<(RegistrationRecord, UpdateVersion)>> {
        match self.store.get(path).await {
            Ok(result) => {
                let version = UpdateVersion {
                    e_tag: result.meta.e_tag.clone(),
                    version: result.meta.version.clone(),
                };
                let bytes = result.bytes().await?;
                let record: RegistrationRecord = serde_json::from_slice(&bytes)?;
                Ok(Some((record, version)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Conditional write of a registration record. A lost race surfaces as
    /// [`Error::Conflict`]. Backends without conditional writes are refused:
    /// an unconditional overwrite would let two nodes hold one identity.
    async fn put_record(&self, path: &Path, record: &RegistrationRecord, mode: PutMode) -> Result<()> {
        let payload = PutPayload::from(Bytes::from(serde_json::to_vec(record)?));
        let opts = PutOptions {
            mode,
            ..Default::default()
        };

        match self.store.put_opts(path, payload, opts).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Err(Error::Conflict),
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                error!(path = %path, store = %self.store, "Object store lacks conditional writes");
                Err(Error::Config(format!(
                    "object store {} does not support conditional writes required for membership",
                    self.store
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<LeaseKeepAlive> {
        let path = self.node_path(&lease.identity);
        let now = Utc::now();

        let (mut record, version) = match self.load_record(&path).await? {
            Some((record, version)) if record.lease_id == lease.id && record.is_live(now) => {
                (record, version)
            }
            _ => return Err(Error::LeaseExpired(lease.id)),
        };

        record.expires_at = now + chrono_ttl(lease.ttl);
        match self
            .put_record(&path, &record, PutMode::Update(version))
            .await
        {
            Ok(()) => Ok(LeaseKeepAlive {
                lease_id: lease.id,
                ttl: lease.ttl,
            }),
            Err(Error::Conflict) => Err(Error::LeaseExpired(lease.id)),
            Err(e) => Err(e),
        }
    }

    async fn read_version(&self) -> Result<Option<String>> {
        match self.store.get(&self.version_path()).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                let version = String::from_utf8_lossy(&bytes).trim().to_string();
                Ok((!version.is_empty()).then_some(version))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

/// State of a polling watch: the last value emitted and consecutive failures
struct PollState<T> {
    membership: ObjectStoreMembership,
    ticker: Interval,
    last: Option<T>,
    failures: u32,
}

impl<T> PollState<T> {
    fn new(membership: ObjectStoreMembership) -> Self {
        let ticker = membership.ticker(membership.poll_interval);
        Self {
            membership,
            ticker,
            last: None,
            failures: 0,
        }
    }
}

#[async_trait]
impl MembershipProvider for ObjectStoreMembership {
    async fn register(&self, identity: &NodeIdentity, ttl: Duration) -> Result<Lease> {
        let path = self.node_path(identity);
        let now = Utc::now();
        let lease_id = now.timestamp_nanos_opt().unwrap_or_default() as u64;
        let record = RegistrationRecord {
            identity: identity.clone(),
            lease_id,
            ttl_ms: ttl.as_millis() as u64,
            expires_at: now + chrono_ttl(ttl),
        };

        let mode = match self.load_record(&path).await? {
            None => PutMode::Create,
            Some((existing, _)) if existing.is_live(now) => {
                return Err(Error::AlreadyRegistered(identity.to_string()));
            }
            Some((existing, version)) => {
                debug!(
                    node = %identity,
                    stale_lease = existing.lease_id,
                    "Replacing expired registration"
                );
                PutMode::Update(version)
            }
        };

        match self.put_record(&path, &record, mode).await {
            Ok(()) => {}
            Err(Error::Conflict) => return Err(Error::AlreadyRegistered(identity.to_string())),
            Err(e) => return Err(e),
        }

        info!(node = %identity, lease_id, ttl_secs = ttl.as_secs(), "Registered node");
        Ok(Lease {
            id: lease_id,
            ttl,
            identity: identity.clone(),
        })
    }

    fn keep_alive(&self, lease: &Lease) -> BoxStream<'static, Result<LeaseKeepAlive>> {
        let ticker = self.ticker((lease.ttl / 3).max(Duration::from_millis(10)));
        let state = Some((self.clone(), lease.clone(), ticker));

        stream::unfold(state, |state| async move {
            let (membership, lease, mut ticker) = state?;
            ticker.tick().await;
            match membership.renew(&lease).await {
                Ok(ack) => {
                    debug!(lease_id = ack.lease_id, "Renewed lease");
                    Some((Ok(ack), Some((membership, lease, ticker))))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    async fn revoke(&self, lease: &Lease) -> Result<()> {
        let path = self.node_path(&lease.identity);
        if let Some((record, _)) = self.load_record(&path).await? {
            if record.lease_id == lease.id {
                match self.store.delete(&path).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                info!(node = %lease.identity, lease_id = lease.id, "Revoked lease");
            }
        }
        Ok(())
    }

    async fn discover_peers(&self) -> Result<Vec<NodeIdentity>> {
        let prefix = self.nodes_prefix();
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let now = Utc::now();

        let mut peers = Vec::with_capacity(objects.len());
        for meta in objects {
            match self.load_record(&meta.location).await {
                Ok(Some((record, _))) if record.is_live(now) => peers.push(record.identity),
                Ok(_) => {}
                Err(Error::Serialization(e)) => {
                    warn!(path = %meta.location, error = %e, "Skipping unreadable registration");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(normalize_peers(peers))
    }

    fn watch_peers(&self) -> BoxStream<'static, Result<Vec<NodeIdentity>>> {
        stream::unfold(Some(PollState::new(self.clone())), |state| async move {
            let mut state: PollState<Vec<NodeIdentity>> = state?;
            loop {
                state.ticker.tick().await;
                match state.membership.discover_peers().await {
                    Ok(peers) => {
                        state.failures = 0;
                        if state.last.as_ref() != Some(&peers) {
                            state.last = Some(peers.clone());
                            return Some((Ok(peers), Some(state)));
                        }
                    }
                    Err(e) => {
                        state.failures += 1;
                        warn!(error = %e, failures = state.failures, "Peer poll failed");
                        if state.failures >= MAX_POLL_FAILURES {
                            return Some((Err(Error::WatchClosed("peers".to_string())), None));
                        }
                    }
                }
            }
        })
        .boxed()
    }

    async fn get_metadata_version(&self) -> Result<Option<String>> {
        self.read_version().await
    }

    async fn set_metadata_version(&self, version: &str) -> Result<()> {
        let payload = PutPayload::from(Bytes::from(version.to_string()));
        self.store.put(&self.version_path(), payload).await?;
        info!(version = %version, "Published metadata version");
        Ok(())
    }

    fn watch_metadata_version(&self) -> BoxStream<'static, Result<String>> {
        stream::unfold(Some(PollState::new(self.clone())), |state| async move {
            let mut state: PollState<String> = state?;
            loop {
                state.ticker.tick().await;
                match state.membership.read_version().await {
                    Ok(Some(version)) => {
                        state.failures = 0;
                        if state.last.as_ref() != Some(&version) {
                            state.last = Some(version.clone());
                            return Some((Ok(version), Some(state)));
                        }
                    }
                    Ok(None) => state.failures = 0,
                    Err(e) => {
                        state.failures += 1;
                        warn!(error = %e, failures = state.failures, "Metadata version poll failed");
                        if state.failures >= MAX_POLL_FAILURES {
                            return Some((
                                Err(Error::WatchClosed("metadata version".to_string())),
                                None,
                            ));
                        }
                    }
                }
            }
        })
        .boxed()
    }
}
