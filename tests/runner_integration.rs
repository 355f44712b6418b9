//! Reaction loop behaviour: once-only processing, causal snapshots,
//! ignored senders, lifecycle.

use commune::client::AgentClient;
use commune::config::NetworkConfig;
use commune::message::{ContentMap, Envelope, MessageThread};
use commune::mods::ModRegistry;
use commune::runner::{AgentReactor, AgentRunner, RunnerState};
use commune::service::NetworkService;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
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

#[derive(Debug, Clone)]
struct Reaction {
    message_id: String,
    sender_id: String,
    causally_consistent: bool,
}

/// Records every reaction and whether its snapshot was causally
/// filtered.
struct RecordingReactor {
    reactions: Arc<tokio::sync::Mutex<Vec<Reaction>>>,
}

#[async_trait]
impl AgentReactor for RecordingReactor {
    async fn react(
        &mut self,
        threads: HashMap<String, MessageThread>,
        _thread_id: String,
        envelope: Envelope,
    ) {
        let cutoff = envelope.timestamp();
        let causally_consistent = threads
            .values()
            .flat_map(|thread| thread.messages())
            .all(|message| message.timestamp() <= cutoff);
        self.reactions.lock().await.push(Reaction {
            message_id: envelope.message_id().to_string(),
            sender_id: envelope.sender_id().to_string(),
            causally_consistent,
        });
    }
}

#[tokio::test]
async fn reactions_are_once_only_and_causally_filtered() {
    let service = NetworkService::new(config(18620)).expect("config");
    service.start().await.expect("start");
    let a1 = connect_agent("a1", 18620).await;

    let reactions = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let runner = AgentRunner::new(
        AgentClient::new("a2"),
        Box::new(RecordingReactor {
            reactions: reactions.clone(),
        }),
    )
    .with_interval(Duration::from_millis(100));
    runner
        .start("127.0.0.1", 18620, ContentMap::new(), &ModRegistry::new())
        .await
        .expect("runner start");
    assert_eq!(runner.state(), RunnerState::Running);

    for i in 0..3u64 {
        let mut content = ContentMap::new();
        content.insert("i".to_string(), json!(i));
        a1.send_direct_message("a2", content)
            .await
            .expect("send")
            .expect("not cancelled");
    }

    assert!(
        settle(Duration::from_secs(5), || async {
            reactions.lock().await.len() == 3
        })
        .await,
        "not all messages were reacted to"
    );

    // No message is reacted to twice, even across later sweeps.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let recorded = reactions.lock().await.clone();
    assert_eq!(recorded.len(), 3);
    let mut ids: Vec<&str> = recorded.iter().map(|r| r.message_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "a message id was reacted to twice");
    assert!(
        recorded.iter().all(|r| r.causally_consistent),
        "a snapshot leaked a future message"
    );

    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Stopped);
    // A second stop is a no-op.
    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Stopped);

    a1.disconnect().await.expect("disconnect");
    service.stop().await.expect("stop");
}

#[tokio::test]
async fn ignored_senders_never_reach_react() {
    let service = NetworkService::new(config(18621)).expect("config");
    service.start().await.expect("start");
    let noisy = connect_agent("noisy", 18621).await;
    let friend = connect_agent("friend", 18621).await;

    let reactions = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let runner = AgentRunner::new(
        AgentClient::new("listener"),
        Box::new(RecordingReactor {
            reactions: reactions.clone(),
        }),
    )
    .with_interval(Duration::from_millis(100))
    .with_ignored_senders(["noisy".to_string()]);
    runner
        .start("127.0.0.1", 18621, ContentMap::new(), &ModRegistry::new())
        .await
        .expect("runner start");

    for _ in 0..2 {
        noisy
            .send_direct_message("listener", ContentMap::new())
            .await
            .expect("send")
            .expect("not cancelled");
    }
    friend
        .send_direct_message("listener", ContentMap::new())
        .await
        .expect("send")
        .expect("not cancelled");

    assert!(
        settle(Duration::from_secs(5), || async {
            reactions.lock().await.len() == 1
        })
        .await,
        "friend's message was not reacted to"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    let recorded = reactions.lock().await.clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].sender_id, "friend");

    runner.stop().await;
    noisy.disconnect().await.expect("disconnect");
    friend.disconnect().await.expect("disconnect");
    service.stop().await.expect("stop");
}

/// Setup failure is fatal to the runner and leaves it stopped.
struct FailingSetupReactor;

#[async_trait]
impl AgentReactor for FailingSetupReactor {
    async fn setup(&mut self, _client: &AgentClient) -> commune::error::Result<()> {
        Err(commune::error::NetworkError::Config(
            "intentional setup failure".to_string(),
        ))
    }

    async fn react(
        &mut self,
        _threads: HashMap<String, MessageThread>,
        _thread_id: String,
        _envelope: Envelope,
    ) {
    }
}

#[tokio::test]
async fn setup_failure_stops_the_runner() {
    let service = NetworkService::new(config(18622)).expect("config");
    service.start().await.expect("start");

    let runner = AgentRunner::new(
        AgentClient::new("doomed"),
        Box::new(FailingSetupReactor),
    );
    let outcome = runner
        .start("127.0.0.1", 18622, ContentMap::new(), &ModRegistry::new())
        .await;
    assert!(outcome.is_err());
    assert_eq!(runner.state(), RunnerState::Stopped);

    service.stop().await.expect("stop");
}
