//! Integration tests for the RPC surface and the fan-out client
//!
//! Peers are in-process axum servers on ephemeral loopback ports.

use patternserve::api::messages::*;
use patternserve::api::{self, PatternService};
use patternserve::client::{ClientConfig, PatternClient, PeerDirectory};
use patternserve::cluster::{NodeIdentity, NodeState, NodeStateHandle, PartitionScheme};
use patternserve::config::ProjectSelection;
use patternserve::metadata::{ProjectCatalog, ProjectModelMetadata};
use patternserve::schema::{PatternWithMeta, PropertiesInfo, UserAndEventsInfo};
use patternserve::store::{CloudRouting, PatternStore, StoreConfig};

use anyhow::Result;
use axum::routing::post;
use axum::{Json, Router};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn bind() -> Result<(TcpListener, NodeIdentity)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, NodeIdentity::new("127.0.0.1", port)))
}

fn serve(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
}

/// A peer answering every call with the same `result` body
async fn canned_peer(result: serde_json::Value) -> Result<NodeIdentity> {
    let (listener, identity) = bind().await?;
    let router = Router::new().route(
        RPC_ENDPOINT,
        post(move |Json(request): Json<RpcRequest>| {
            let result = result.clone();
            async move {
                Json(RpcResponse {
                    result: Some(result),
                    error: None,
                    id: request.id,
                })
            }
        }),
    );
    serve(listener, router);
    Ok(identity)
}

fn client(peers: Vec<NodeIdentity>) -> PatternClient {
    PatternClient::new(
        PeerDirectory::from_static(peers),
        ClientConfig {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(5),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_ignored_and_failed_peers_do_not_hide_the_owner() -> Result<()> {
    let a = canned_peer(json!({"pid": 5, "mid": 1, "ignored": true, "error": null, "values": []})).await?;
    let b = canned_peer(json!({"pid": 5, "mid": 1, "ignored": false, "error": "disk on fire", "values": ["junk"]})).await?;
    let c = canned_peer(json!({"pid": 5, "mid": 1, "ignored": false, "error": null, "values": ["free", "pro"]})).await?;

    let gathered = client(vec![a, b, c])
        .get_seen_event_property_values(5, None, "signup", "plan")
        .await;

    assert_eq!(gathered.value, vec!["free", "pro"]);
    assert_eq!(gathered.peers, 3);
    assert_eq!(gathered.responded, 1);
    assert_eq!(gathered.ignored, 1);
    assert_eq!(gathered.failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_slow_peer_is_cut_off_by_the_call_timeout() -> Result<()> {
    let (listener, slow) = bind().await?;
    serve(
        listener,
        Router::new().route(
            RPC_ENDPOINT,
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({}))
            }),
        ),
    );
    let fast = canned_peer(json!({"pid": 4, "ignored": false, "intervals": [{"mid": 1, "mt": "w", "st": 10, "et": 20}]})).await?;

    let client = PatternClient::new(
        PeerDirectory::from_static(vec![slow, fast]),
        ClientConfig {
            max_concurrency: 2,
            call_timeout: Duration::from_millis(300),
        },
    )?;
    let gathered = client.get_project_models_intervals(4).await;

    assert_eq!(gathered.failed, 1);
    assert_eq!(gathered.responded, 1);
    assert_eq!(gathered.value.len(), 1);
    assert_eq!(gathered.value[0].model_id, 1);
    Ok(())
}

struct Cluster {
    peers: Vec<NodeIdentity>,
}

fn catalog() -> ProjectCatalog {
    let record = |pid, mid, chunks: &str, end| ProjectModelMetadata {
        project_id: pid,
        model_id: mid,
        model_type: "w".to_string(),
        chunks: chunks.to_string(),
        start_time: 0,
        end_time: end,
    };
    ProjectCatalog::from_records(
        vec![
            record(4, 1, "1", 10),
            record(4, 2, "1,2", 20),
            record(5, 3, "1", 30),
        ],
        &ProjectSelection::All,
    )
}

fn signup_info() -> UserAndEventsInfo {
    let signup = PropertiesInfo {
        numeric_property_keys: BTreeMap::from([("amount".to_string(), true)]),
        categorical_property_key_values: BTreeMap::from([(
            "plan".to_string(),
            BTreeMap::from([("free".to_string(), true), ("pro".to_string(), true)]),
        )]),
    };
    UserAndEventsInfo {
        user_properties_info: None,
        event_properties_info_map: Some(BTreeMap::from([("signup".to_string(), signup)])),
        model_version: 2,
    }
}

fn pattern(events: &[&str], count: u64) -> PatternWithMeta {
    PatternWithMeta {
        pattern_events: events.iter().map(|e| e.to_string()).collect(),
        raw_pattern: json!({"en": events, "c": count}),
    }
}

/// Two real pattern servers sharing one cloud bucket
async fn two_node_cluster() -> Result<Cluster> {
    let cloud: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let seed = PatternStore::new(
        Arc::new(InMemory::new()),
        CloudRouting::new(cloud.clone()),
        StoreConfig::default(),
    );
    seed.put_event_info_cloud(4, 2, &signup_info()).await?;
    seed.put_patterns_cloud(4, 2, "1", &[pattern(&["a", "b"], 3), pattern(&["b"], 4)])
        .await?;
    seed.put_patterns_cloud(
        4,
        2,
        "2",
        &[pattern(&["a", "c"], 5), pattern(&["b", "c"], 7), pattern(&["c"], 9)],
    )
    .await?;
    seed.put_patterns_cloud(5, 3, "1", &[pattern(&["x"], 1)]).await?;

    let (l1, id1) = bind().await?;
    let (l2, id2) = bind().await?;
    let peers = vec![id1.clone(), id2.clone()];
    let catalog = Arc::new(catalog());

    for (listener, identity) in [(l1, id1), (l2, id2)] {
        let store = Arc::new(PatternStore::new(
            Arc::new(InMemory::new()),
            CloudRouting::new(cloud.clone()),
            StoreConfig::default(),
        ));
        let state = NodeStateHandle::new(NodeState::new(
            identity,
            PartitionScheme::Project,
            peers.clone(),
            "version1",
            catalog.clone(),
        ));
        let service = Arc::new(PatternService::new(store, state));
        serve(listener, api::build_rpc_router(service));
    }

    Ok(Cluster { peers })
}

#[tokio::test]
async fn test_cluster_answers_each_key_exactly_once() -> Result<()> {
    let cluster = two_node_cluster().await?;
    let client = client(cluster.peers);

    let properties = client.get_seen_event_properties(4, None, "signup").await;
    assert_eq!(properties.responded, 1);
    assert_eq!(properties.ignored, 1);
    assert_eq!(properties.failed, 0);
    assert_eq!(properties.value[NUMERICAL_PROPERTIES], vec!["amount"]);
    assert_eq!(properties.value[CATEGORICAL_PROPERTIES], vec!["plan"]);

    let values = client
        .get_seen_event_property_values(4, Some(2), "signup", "plan")
        .await;
    assert_eq!(values.value, vec!["free", "pro"]);

    let intervals = client.get_project_models_intervals(4).await;
    let mids: Vec<u64> = intervals.value.iter().map(|i| i.model_id).collect();
    assert_eq!(mids, vec![1, 2]);

    let info = client.get_user_and_events_info(4, None).await;
    assert_eq!(info.value, Some(signup_info()));

    let patterns = client.get_all_patterns(4, None, "a", "").await;
    assert_eq!(patterns.responded, 1);
    assert_eq!(
        patterns.value,
        vec![json!({"en": ["a", "b"], "c": 3}), json!({"en": ["a", "c"], "c": 5})]
    );

    // Project 5 has no event info stored: the owner reports the miss.
    let missing = client.get_user_and_events_info(5, None).await;
    assert_eq!(missing.value, None);
    assert_eq!(missing.failed, 1);
    assert_eq!(missing.ignored, 1);
    Ok(())
}

#[tokio::test]
async fn test_cluster_pattern_lookups_come_from_the_owner() -> Result<()> {
    let cluster = two_node_cluster().await?;
    let client = client(cluster.peers);

    let containing = client.get_all_containing_patterns(4, None, "c").await;
    assert_eq!(containing.responded, 1);
    assert_eq!(containing.ignored, 1);
    assert_eq!(
        containing.value,
        vec![
            json!({"en": ["a", "c"], "c": 5}),
            json!({"en": ["b", "c"], "c": 7}),
            json!({"en": ["c"], "c": 9}),
        ]
    );

    let exact = client
        .get_patterns(
            4,
            Some(2),
            vec![
                vec!["b".to_string(), "c".to_string()],
                vec!["x".to_string()],
            ],
        )
        .await;
    assert_eq!(exact.responded, 1);
    assert_eq!(exact.value, vec![json!({"en": ["b", "c"], "c": 7})]);

    // Project 5 lives on the other node.
    let other = client.get_patterns(5, None, vec![vec!["x".to_string()]]).await;
    assert_eq!(other.responded, 1);
    assert_eq!(other.ignored, 1);
    assert_eq!(other.value, vec![json!({"en": ["x"], "c": 1})]);

    let total = client.get_total_event_count(4, None).await;
    assert_eq!(total.responded, 1);
    assert_eq!(total.ignored, 1);
    assert_eq!(total.value, 13);
    Ok(())
}

#[tokio::test]
async fn test_total_event_count_is_summed_across_peers() -> Result<()> {
    // Under per-model partitioning several peers can answer for one project.
    let a = canned_peer(json!({"pid": 4, "mid": 1, "ignored": false, "tec": 10})).await?;
    let b = canned_peer(json!({"pid": 4, "mid": 2, "ignored": false, "tec": 32})).await?;
    let c = canned_peer(json!({"pid": 4, "mid": 0, "ignored": true, "tec": 0})).await?;

    let total = client(vec![a, b, c]).get_total_event_count(4, None).await;
    assert_eq!(total.value, 42);
    assert_eq!(total.responded, 2);
    assert_eq!(total.ignored, 1);
    assert_eq!(total.failed, 0);
    Ok(())
}

#[tokio::test]
async fn test_rpc_envelope_errors() -> Result<()> {
    let cluster = two_node_cluster().await?;
    let url = format!("http://{}{}", cluster.peers[0], RPC_ENDPOINT);
    let http = reqwest::Client::new();

    let reply: RpcResponse = http
        .post(&url)
        .json(&json!({"method": "ps.NoSuchMethod", "params": [{}], "id": 1}))
        .send()
        .await?
        .json()
        .await?;
    assert!(reply.result.is_none());
    assert!(reply.error.unwrap().contains("NoSuchMethod"));
    assert_eq!(reply.id, json!(1));

    let reply: RpcResponse = http
        .post(&url)
        .header(REQUEST_ID_HEADER, "req-42")
        .json(&json!({"method": "ps.GetSeenEventProperties", "params": [{"pid": 4}], "id": 2}))
        .send()
        .await?
        .json()
        .await?;
    assert!(reply.result.is_none());
    assert!(reply.error.unwrap().contains("en"));

    // A body that is not an envelope still gets one back.
    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .body("{\"method\": ")
        .send()
        .await?;
    assert!(response.status().is_success());
    let reply: RpcResponse = response.json().await?;
    assert!(reply.result.is_none());
    assert!(reply.error.unwrap().contains("malformed request envelope"));
    assert_eq!(reply.id, serde_json::Value::Null);

    let reply: RpcResponse = http.post(&url).body("not json").send().await?.json().await?;
    assert!(reply.error.is_some());
    Ok(())
}

#[tokio::test]
async fn test_status_endpoints() -> Result<()> {
    let identity: NodeIdentity = "n1:8100".parse()?;
    let store = Arc::new(PatternStore::new(
        Arc::new(InMemory::new()),
        CloudRouting::new(Arc::new(InMemory::new())),
        StoreConfig::default(),
    ));
    let state = NodeStateHandle::new(NodeState::new(
        identity.clone(),
        PartitionScheme::Project,
        vec![identity],
        "version7",
        Arc::new(catalog()),
    ));

    let (listener, _) = bind().await?;
    let addr = listener.local_addr()?;
    serve(listener, api::build_status_router(state, store));

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/status")).await?.json().await?;
    assert_eq!(status, json!({"status": "success"}));

    let dump: serde_json::Value = reqwest::get(format!("http://{addr}/state")).await?.json().await?;
    assert_eq!(dump["node"]["identity"], json!("n1:8100"));
    assert_eq!(dump["node"]["ordinal"], json!(0));
    assert_eq!(dump["node"]["metadata_version"], json!("version7"));
    assert_eq!(dump["store"]["misses"], json!(0));
    Ok(())
}
