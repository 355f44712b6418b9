//! Server-side mod pipeline behaviour over a live network.

use commune::client::AgentClient;
use commune::config::NetworkConfig;
use commune::message::{ContentMap, DirectMessage, ModDirection, ModMessage};
use commune::mods::{ModRegistry, NetworkMod, RegistrationAdapter};
use commune::service::NetworkService;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn config(port: u16) -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.port = port;
    config
}

async fn connect_agent(agent_id: &str, port: u16) -> AgentClient {
    let client = AgentClient::new(agent_id);
    client
        .connect("127.0.0.1", port, ContentMap::new(), Vec::new())
        .await
        .expect("connect");
    client
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

/// Drops direct messages whose content carries `drop: true`.
struct FilterMod;

#[async_trait]
impl NetworkMod for FilterMod {
    fn mod_name(&self) -> &str {
        "filter"
    }

    fn requires_adapter(&self) -> bool {
        false
    }

    async fn process_direct_message(&self, message: DirectMessage) -> Option<DirectMessage> {
        if message.content.get("drop") == Some(&Value::Bool(true)) {
            return None;
        }
        Some(message)
    }
}

/// Records every mod-scoped message it receives.
struct RecorderMod {
    received: Arc<tokio::sync::Mutex<Vec<ModMessage>>>,
}

#[async_trait]
impl NetworkMod for RecorderMod {
    fn mod_name(&self) -> &str {
        "m"
    }

    fn requires_adapter(&self) -> bool {
        false
    }

    async fn process_mod_message(&self, message: ModMessage) {
        self.received.lock().await.push(message);
    }
}

#[tokio::test]
async fn server_mod_drop_filters_messages() {
    let service = NetworkService::new(config(18610)).expect("config");
    service.register_mod(Arc::new(FilterMod)).await.expect("mod");
    service.start().await.expect("start");

    let a1 = connect_agent("a1", 18610).await;
    let a2 = connect_agent("a2", 18610).await;

    let mut dropped = ContentMap::new();
    dropped.insert("drop".to_string(), json!(true));
    dropped.insert("text".to_string(), json!("never seen"));
    a1.send_direct_message("a2", dropped)
        .await
        .expect("send")
        .expect("not cancelled");

    let mut kept = ContentMap::new();
    kept.insert("text".to_string(), json!("kept"));
    a1.send_direct_message("a2", kept)
        .await
        .expect("send")
        .expect("not cancelled");

    assert!(
        settle(Duration::from_secs(5), || async {
            a2.thread("direct_message:a1")
                .await
                .map(|t| t.len() == 1)
                .unwrap_or(false)
        })
        .await,
        "the kept message never arrived"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    let thread = a2.thread("direct_message:a1").await.expect("thread");
    assert_eq!(thread.len(), 1);
    assert_eq!(thread.messages()[0].content()["text"], "kept");

    a1.disconnect().await.expect("disconnect");
    a2.disconnect().await.expect("disconnect");
    service.stop().await.expect("stop");
}

#[tokio::test]
async fn mod_scoped_messages_terminate_at_the_mod() {
    let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let service = NetworkService::new(config(18611)).expect("config");
    service
        .register_mod(Arc::new(RecorderMod {
            received: received.clone(),
        }))
        .await
        .expect("mod");
    service.start().await.expect("start");

    let a1 = connect_agent("a1", 18611).await;
    let a2 = connect_agent("a2", 18611).await;

    let mut content = ContentMap::new();
    content.insert("x".to_string(), json!(1));
    a1.send_mod_message("m", ModDirection::Outbound, "a2", content)
        .await
        .expect("send")
        .expect("not cancelled");

    assert!(
        settle(Duration::from_secs(5), || async {
            !received.lock().await.is_empty()
        })
        .await,
        "the mod never saw its message"
    );
    let messages = received.lock().await;
    assert_eq!(messages[0].content["x"], 1);
    assert_eq!(messages[0].relevant_agent_id, "a2");
    drop(messages);

    // The envelope is terminal at the mod: a2 receives nothing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a2.get_message_threads().await.is_empty());

    a1.disconnect().await.expect("disconnect");
    a2.disconnect().await.expect("disconnect");
    service.stop().await.expect("stop");
}

#[tokio::test]
async fn registration_mod_answers_search_queries() {
    let service = NetworkService::new(config(18612)).expect("config");
    let registry = ModRegistry::with_builtins();
    let failures = service
        .load_mods(&registry, &["registration".to_string()])
        .await;
    assert!(failures.is_empty());
    service.start().await.expect("start");

    // a1 carries the adapter; a2 advertises a capability in metadata.
    let a1 = AgentClient::new("a1");
    let adapter = Arc::new(RegistrationAdapter::new());
    a1.register_mod_adapter(adapter.clone()).await;
    a1.connect("127.0.0.1", 18612, ContentMap::new(), Vec::new())
        .await
        .expect("connect");

    let mut metadata = ContentMap::new();
    metadata.insert("capabilities".to_string(), json!(["translate"]));
    let a2 = AgentClient::new("a2");
    a2.connect("127.0.0.1", 18612, metadata, vec!["translate".to_string()])
        .await
        .expect("connect");

    let tools = a1.get_tools().await;
    let search = tools
        .iter()
        .find(|tool| tool.name == "search_agents")
        .expect("tool advertised");
    let outcome = search
        .handler
        .call(json!({ "capability": "translate" }))
        .await
        .expect("tool call");
    assert_eq!(outcome["status"], "requested");

    assert!(
        settle(Duration::from_secs(5), || async {
            adapter
                .last_results()
                .await
                .map(|agents| agents.iter().any(|a| a["agent_id"] == "a2"))
                .unwrap_or(false)
        })
        .await,
        "search results never arrived"
    );

    // The reply also lands in the mod's message thread.
    let thread = a1
        .thread("mod_message:registration")
        .await
        .expect("mod thread");
    assert!(!thread.is_empty());

    a1.disconnect().await.expect("disconnect");
    a2.disconnect().await.expect("disconnect");
    service.stop().await.expect("stop");
}
