//! Fan-out client for the `ps` service
//!
//! Every logical query is broadcast to all known peers. Non-owners answer
//! `ignored`; the owner answers with data or an error. Results are merged per
//! method and the per-peer outcome counts are returned alongside.

mod peers;
mod telemetry;

pub use peers::PeerDirectory;

use crate::api::messages::*;
use crate::cluster::NodeIdentity;
use crate::metadata::ModelInterval;
use crate::schema::UserAndEventsInfo;
use crate::{Error, Result};

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fan-out client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum number of peer calls in flight per broadcast
    pub max_concurrency: usize,
    /// Deadline for a single peer call
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Merged result of one broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gathered<T> {
    pub value: T,
    /// Peers the call was sent to
    pub peers: usize,
    /// Peers that answered with data
    pub responded: usize,
    /// Peers that do not own the key
    pub ignored: usize,
    /// Peers that failed in transport or answered with an error
    pub failed: usize,
}

pub struct PatternClient {
    http: reqwest::Client,
    peers: PeerDirectory,
    config: ClientConfig,
    next_request_id: AtomicU64,
}

impl PatternClient {
    pub fn new(peers: PeerDirectory, config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()?;
        Ok(Self {
            http,
            peers,
            config,
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Call one peer, bounded by the per-call deadline.
    pub async fn call<M: RpcMethod>(
        &self,
        peer: &NodeIdentity,
        request: &M::Request,
    ) -> Result<M::Response> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RpcRequest::new::<M>(request, request_id)?;
        let url = format!("http://{}{}", peer, RPC_ENDPOINT);

        let exchange = async {
            let reply: RpcResponse = self
                .http
                .post(&url)
                .header(REQUEST_ID_HEADER, request_id.to_string())
                .json(&envelope)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if let Some(error) = reply.error {
                return Err(Error::Rpc(error));
            }
            let result = reply
                .result
                .ok_or_else(|| Error::Rpc(format!("empty result from {}", peer)))?;
            Ok::<_, Error>(serde_json::from_value::<M::Response>(result)?)
        };

        tokio::time::timeout(self.config.call_timeout, exchange).await?
    }

    /// Send the request to every known peer with bounded concurrency.
    pub async fn broadcast<M: RpcMethod>(
        &self,
        request: &M::Request,
    ) -> Vec<(NodeIdentity, Result<M::Response>)> {
        let peers = self.peers.peers();
        let started = Instant::now();
        let peer_count = peers.len();

        let results = stream::iter(peers)
            .map(|peer| async move {
                let call_started = Instant::now();
                let result = self.call::<M>(&peer, request).await;
                let outcome = match &result {
                    Ok(response) if response.generic().ignored => "ignored",
                    Ok(response) if response.generic().error.is_some() => "error",
                    Ok(_) => "ok",
                    Err(Error::Timeout) => "timeout",
                    Err(_) => "failed",
                };
                telemetry::record_peer_call(M::NAME, outcome, call_started.elapsed().as_secs_f64());
                (peer, result)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        telemetry::record_fanout(M::NAME, peer_count, started.elapsed().as_secs_f64());
        results
    }

    /// Broadcast and fold useful responses into `init`. Ignored answers are
    /// counted; failures are logged and counted.
    async fn gather<M, T, F>(&self, request: &M::Request, init: T, mut fold: F) -> Gathered<T>
    where
        M: RpcMethod,
        F: FnMut(&mut T, M::Response),
    {
        let results = self.broadcast::<M>(request).await;
        let mut gathered = Gathered {
            value: init,
            peers: results.len(),
            responded: 0,
            ignored: 0,
            failed: 0,
        };

        for (peer, result) in results {
            match result {
                Ok(response) if response.generic().ignored => {
                    debug!(peer = %peer, method = M::NAME, "Peer ignored request");
                    gathered.ignored += 1;
                }
                Ok(response) => {
                    if let Some(error) = &response.generic().error {
                        warn!(peer = %peer, method = M::NAME, error = %error, "Peer answered with error");
                        gathered.failed += 1;
                        continue;
                    }
                    gathered.responded += 1;
                    fold(&mut gathered.value, response);
                }
                Err(e) => {
                    warn!(peer = %peer, method = M::NAME, error = %e, "Peer call failed");
                    gathered.failed += 1;
                }
            }
        }

        gathered
    }

    /// Property names of an event, merged across peers
    pub async fn get_seen_event_properties(
        &self,
        project_id: u64,
        model_id: Option<u64>,
        event_name: &str,
    ) -> Gathered<BTreeMap<String, Vec<String>>> {
        let request = GetSeenEventPropertiesRequest {
            project_id,
            model_id,
            event_name: event_name.to_string(),
        };
        self.gather::<GetSeenEventProperties, _, _>(&request, BTreeMap::new(), |acc, response| {
            acc.extend(response.properties)
        })
        .await
    }

    /// Values of a categorical property, concatenated across peers
    pub async fn get_seen_event_property_values(
        &self,
        project_id: u64,
        model_id: Option<u64>,
        event_name: &str,
        property_name: &str,
    ) -> Gathered<Vec<String>> {
        let request = GetSeenEventPropertyValuesRequest {
            project_id,
            model_id,
            event_name: event_name.to_string(),
            property_name: property_name.to_string(),
        };
        self.gather::<GetSeenEventPropertyValues, _, _>(&request, Vec::new(), |acc, response| {
            acc.extend(response.values)
        })
        .await
    }

    pub async fn get_project_models_intervals(&self, project_id: u64) -> Gathered<Vec<ModelInterval>> {
        let request = GetProjectModelsIntervalsRequest { project_id };
        self.gather::<GetProjectModelsIntervals, _, _>(&request, Vec::new(), |acc, response| {
            acc.extend(response.intervals)
        })
        .await
    }

    /// Event info from the owning peer, if any answered
    pub async fn get_user_and_events_info(
        &self,
        project_id: u64,
        model_id: Option<u64>,
    ) -> Gathered<Option<UserAndEventsInfo>> {
        let request = GetUserAndEventsInfoRequest {
            project_id,
            model_id,
        };
        self.gather::<GetUserAndEventsInfo, _, _>(&request, None, |acc, response| {
            if acc.is_none() {
                *acc = Some(response.user_and_events_info);
            }
        })
        .await
    }

    pub async fn get_all_patterns(
        &self,
        project_id: u64,
        model_id: Option<u64>,
        start_event: &str,
        end_event: &str,
    ) -> Gathered<Vec<serde_json::Value>> {
        let request = GetAllPatternsRequest {
            project_id,
            model_id,
            start_event: start_event.to_string(),
            end_event: end_event.to_string(),
        };
        self.gather::<GetAllPatterns, _, _>(&request, Vec::new(), |acc, response| {
            acc.extend(response.patterns)
        })
        .await
    }

    /// Patterns that include `event_name`, concatenated across peers
    pub async fn get_all_containing_patterns(
        &self,
        project_id: u64,
        model_id: Option<u64>,
        event_name: &str,
    ) -> Gathered<Vec<serde_json::Value>> {
        let request = GetAllContainingPatternsRequest {
            project_id,
            model_id,
            event_name: event_name.to_string(),
        };
        self.gather::<GetAllContainingPatterns, _, _>(&request, Vec::new(), |acc, response| {
            acc.extend(response.patterns)
        })
        .await
    }

    pub async fn get_patterns(
        &self,
        project_id: u64,
        model_id: Option<u64>,
        pattern_events: Vec<Vec<String>>,
    ) -> Gathered<Vec<serde_json::Value>> {
        let request = GetPatternsRequest {
            project_id,
            model_id,
            pattern_events,
        };
        self.gather::<GetPatterns, _, _>(&request, Vec::new(), |acc, response| {
            acc.extend(response.patterns)
        })
        .await
    }

    /// Total event count, summed over every answering peer
    pub async fn get_total_event_count(&self, project_id: u64, model_id: Option<u64>) -> Gathered<u64> {
        let request = GetTotalEventCountRequest {
            project_id,
            model_id,
        };
        self.gather::<GetTotalEventCount, _, _>(&request, 0, |acc, response| {
            *acc += response.total_event_count
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_without_peers_is_empty() {
        let client = PatternClient::new(PeerDirectory::default(), ClientConfig::default()).unwrap();
        let gathered = client.get_project_models_intervals(4).await;
        assert_eq!(gathered, Gathered::default());
    }

    #[tokio::test]
    async fn test_unreachable_peer_counts_as_failed() {
        // Port 1 on loopback refuses connections.
        let peers = PeerDirectory::from_static(vec!["127.0.0.1:1".parse().unwrap()]);
        let client = PatternClient::new(
            peers,
            ClientConfig {
                max_concurrency: 4,
                call_timeout: Duration::from_secs(2),
            },
        )
        .unwrap();

        let gathered = client.get_seen_event_property_values(4, None, "signup", "plan").await;
        assert_eq!(gathered.peers, 1);
        assert_eq!(gathered.failed, 1);
        assert!(gathered.value.is_empty());
    }
}
