//! Two decentralized nodes: announce propagation, relayed directs, and
//! TTL-bounded broadcast gossip.

use commune::client::AgentClient;
use commune::config::{NetworkConfig, TopologyMode};
use commune::message::ContentMap;
use commune::service::NetworkService;
use serde_json::json;
use std::time::Duration;

fn node_config(port: u16, node_id: &str, bootstrap: Vec<String>) -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.mode = TopologyMode::Decentralized;
    config.port = port;
    config.node_id = Some(node_id.to_string());
    config.bootstrap_nodes = bootstrap;
    config
}

async fn settle<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn two_node_mesh_relays_directs_and_gossips_broadcasts() {
    let node_a = NetworkService::new(node_config(18630, "node-a", Vec::new())).expect("config");
    node_a.start().await.expect("start node a");

    let node_b = NetworkService::new(node_config(
        18631,
        "node-b",
        vec!["ws://127.0.0.1:18630".to_string()],
    ))
    .expect("config");
    node_b.start().await.expect("start node b");

    // a1 joins node A, a2 joins node B.
    let a1 = AgentClient::new("a1");
    a1.connect("127.0.0.1", 18630, ContentMap::new(), Vec::new())
        .await
        .expect("a1 connect");
    let a2 = AgentClient::new("a2");
    a2.connect("127.0.0.1", 18631, ContentMap::new(), Vec::new())
        .await
        .expect("a2 connect");

    // Announce floods teach each node about the other's agent.
    assert!(
        settle(Duration::from_secs(5), || async {
            let a_knows = node_a
                .list_agents()
                .await
                .iter()
                .any(|info| info.agent_id == "a2");
            let b_knows = node_b
                .list_agents()
                .await
                .iter()
                .any(|info| info.agent_id == "a1");
            a_knows && b_knows
        })
        .await,
        "announce flood never converged"
    );

    // A direct across nodes rides the bounded-hop relay.
    let mut content = ContentMap::new();
    content.insert("text".to_string(), json!("across the mesh"));
    a1.send_direct_message("a2", content)
        .await
        .expect("send")
        .expect("not cancelled");

    assert!(
        settle(Duration::from_secs(5), || async {
            a2.thread("direct_message:a1")
                .await
                .map(|thread| thread.len() == 1)
                .unwrap_or(false)
        })
        .await,
        "relayed direct never arrived"
    );
    let thread = a2.thread("direct_message:a1").await.expect("thread");
    assert_eq!(thread.messages()[0].content()["text"], "across the mesh");

    // A broadcast gossips across the mesh and reaches the remote agent
    // exactly once (the seen-set stops echoes).
    a1.send_broadcast_message({
        let mut content = ContentMap::new();
        content.insert("text".to_string(), json!("hello mesh"));
        content
    })
    .await
    .expect("broadcast")
    .expect("not cancelled");

    assert!(
        settle(Duration::from_secs(5), || async {
            a2.thread("broadcast_message")
                .await
                .map(|thread| thread.len() == 1)
                .unwrap_or(false)
        })
        .await,
        "gossiped broadcast never arrived"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    let broadcasts = a2.thread("broadcast_message").await.expect("thread");
    assert_eq!(broadcasts.len(), 1, "broadcast arrived more than once");

    a1.disconnect().await.expect("disconnect");
    a2.disconnect().await.expect("disconnect");
    node_b.stop().await.expect("stop");
    node_a.stop().await.expect("stop");
}
