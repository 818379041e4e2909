//! Three nodes talking real gRPC on loopback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tonic::transport::Channel;

use mimir_cache::{CacheConfig, ConfigCache};
use mimir_consensus::{ConfigNode, RaftConfig};
use mimir_proto::v1::{
    config_service_client::ConfigServiceClient, GetConfigRequest, HealthRequest,
    PutConfigRequest, ReadConsistency, Role,
};
use mimir_server::{
    serve_client, serve_cluster, AdmissionConfig, AdmissionControl, ConfigServiceImpl,
    GrpcNetwork, ServerConfig,
};
use mimir_storage::mem::{MemLogStorage, MemStateMachine};
use mimir_storage::PinRegistry;
use mimir_types::{NodeId, Role as RaftRole};

type Node = ConfigNode<MemStateMachine, GrpcNetwork>;

async fn start_cluster() -> (Vec<Node>, Vec<String>) {
    let ids: Vec<NodeId> = vec![1, 2, 3];
    let config = ServerConfig::default();

    let mut cluster_listeners = Vec::new();
    let mut peers = HashMap::new();
    for &id in &ids {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        peers.insert(id, listener.local_addr().unwrap().to_string());
        cluster_listeners.push(listener);
    }

    let mut nodes = Vec::new();
    let mut client_addrs = Vec::new();
    for (&id, cluster_listener) in ids.iter().zip(cluster_listeners) {
        let network =
            GrpcNetwork::new(&peers, config.peer_connect_timeout(), config.max_message_bytes)
                .unwrap();
        let node = ConfigNode::start(
            id,
            ids.clone(),
            RaftConfig::default(),
            Arc::new(MemLogStorage::new()),
            Arc::new(MemStateMachine::new()),
            Arc::new(network),
        )
        .await
        .unwrap();

        let cfg = config.clone();
        let raft_node = node.clone();
        tokio::spawn(async move {
            serve_cluster(cluster_listener, raft_node, &cfg, std::future::pending()).await
        });

        let cache = Arc::new(ConfigCache::new(Arc::new(node.clone()), CacheConfig::default()));
        cache.spawn_invalidation();
        let service = ConfigServiceImpl::new(
            cache,
            PinRegistry::new(),
            Arc::new(AdmissionControl::new(AdmissionConfig::default())),
            config.max_batch_keys,
        );
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        client_addrs.push(format!("http://{}", client_listener.local_addr().unwrap()));
        let cfg = config.clone();
        tokio::spawn(async move {
            serve_client(client_listener, service, &cfg, std::future::pending()).await
        });

        nodes.push(node);
    }
    (nodes, client_addrs)
}

async fn wait_for_leader(nodes: &[Node]) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let statuses: Vec<_> = nodes.iter().map(|n| n.status()).collect();
        let leaders: Vec<_> =
            statuses.iter().enumerate().filter(|(_, s)| s.role == RaftRole::Leader).collect();
        if let [(pos, leader)] = leaders.as_slice() {
            if statuses.iter().all(|s| s.leader_id == Some(nodes[*pos].id()) && s.term == leader.term) {
                return *pos;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn client(addr: &str) -> ConfigServiceClient<Channel> {
    ConfigServiceClient::connect(addr.to_string()).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_through_follower_read_elsewhere() {
    let (nodes, addrs) = start_cluster().await;
    let leader = wait_for_leader(&nodes).await;
    let followers: Vec<usize> = (0..nodes.len()).filter(|i| *i != leader).collect();

    let mut writer = client(&addrs[followers[0]]).await;
    let put = writer
        .put_config(PutConfigRequest {
            namespace: "checkout".into(),
            key: "timeouts".into(),
            value_json: r#"{"connect_ms": 250}"#.into(),
            description: None,
            expected_version: None,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(put.version, 1);

    let mut reader = client(&addrs[followers[1]]).await;
    let got = reader
        .get_config(GetConfigRequest {
            namespace: "checkout".into(),
            key: "timeouts".into(),
            version: None,
            consistency: ReadConsistency::Linearizable.into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(got.version, 1);
    let value: serde_json::Value = serde_json::from_str(&got.value_json).unwrap();
    assert_eq!(value, serde_json::json!({"connect_ms": 250}));

    let conflict = writer
        .put_config(PutConfigRequest {
            namespace: "checkout".into(),
            key: "timeouts".into(),
            value_json: "{}".into(),
            description: None,
            expected_version: Some(0),
        })
        .await
        .unwrap_err();
    assert_eq!(conflict.code(), tonic::Code::Aborted);

    let health = client(&addrs[leader])
        .await
        .health(HealthRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(health.role, Role::Leader as i32);
    assert_eq!(health.leader_id, Some(nodes[leader].id()));
    assert!(health.commit_index >= 2);
}
