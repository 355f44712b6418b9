//! Agent runner: the reaction loop.
//!
//! An [`AgentRunner`] drives a user-supplied [`AgentReactor`] over an
//! [`AgentClient`]. Every sweep it picks the earliest-timestamped
//! unprocessed message across all threads, marks it processed, and
//! invokes `react` with a causally-filtered snapshot — every envelope in
//! the snapshot is at or before the chosen message's timestamp, so a
//! reaction always sees a consistent prefix of history.
//!
//! The loop is single-threaded and cooperative: a long `react` stalls
//! the loop, which is the intended backpressure — an agent does not
//! interleave its reactions. `processed_ids` therefore needs no
//! synchronization.

use crate::client::AgentClient;
use crate::error::{NetworkError, Result};
use crate::message::{ContentMap, Envelope, MessageThread};
use crate::mods::ModRegistry;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Default sweep interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Runner lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Ready,
    Running,
    Stopping,
    Stopped,
}

/// User logic driven by a runner.
#[async_trait]
pub trait AgentReactor: Send {
    /// One-time setup after the client connects. Errors are fatal to
    /// the runner.
    async fn setup(&mut self, _client: &AgentClient) -> Result<()> {
        Ok(())
    }

    /// React to one incoming message.
    ///
    /// `threads` is the causally-filtered snapshot, `thread_id` names
    /// the thread holding `envelope`.
    async fn react(
        &mut self,
        threads: HashMap<String, MessageThread>,
        thread_id: String,
        envelope: Envelope,
    );

    /// Teardown before disconnect.
    async fn teardown(&mut self, _client: &AgentClient) -> Result<()> {
        Ok(())
    }
}

/// Drives a reactor's lifecycle and reaction loop.
pub struct AgentRunner {
    client: AgentClient,
    interval: Duration,
    ignored_sender_ids: HashSet<String>,
    reactor: Mutex<Option<Box<dyn AgentReactor>>>,
    state: watch::Sender<RunnerState>,
    stop: watch::Sender<bool>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("agent_id", &self.client.agent_id())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl AgentRunner {
    /// Create a runner for `client` driving `reactor`.
    #[must_use]
    pub fn new(client: AgentClient, reactor: Box<dyn AgentReactor>) -> Self {
        let (state, _) = watch::channel(RunnerState::Init);
        let (stop, _) = watch::channel(false);
        Self {
            client,
            interval: DEFAULT_INTERVAL,
            ignored_sender_ids: HashSet::new(),
            reactor: Mutex::new(Some(reactor)),
            state,
            stop,
            loop_handle: Mutex::new(None),
        }
    }

    /// Set the sweep interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Ignore messages from these senders (they are still marked
    /// processed).
    #[must_use]
    pub fn with_ignored_senders(mut self, ignored: impl IntoIterator<Item = String>) -> Self {
        self.ignored_sender_ids = ignored.into_iter().collect();
        self
    }

    /// The driven client.
    #[must_use]
    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Connect, auto-load adapters the server's mods require, run user
    /// setup, and spawn the reaction loop.
    ///
    /// # Errors
    ///
    /// Connection and `setup` failures are fatal; the runner cleans up
    /// and returns the error.
    pub async fn start(
        &self,
        host: &str,
        port: u16,
        metadata: ContentMap,
        registry: &ModRegistry,
    ) -> Result<()> {
        if self.state() != RunnerState::Init {
            return Err(NetworkError::Config(
                "runner already started".to_string(),
            ));
        }
        self.client
            .connect(host, port, metadata, Vec::new())
            .await?;
        self.state.send_replace(RunnerState::Ready);

        // Load adapters for the mods the server flags as requiring one.
        match self.client.list_mods().await {
            Ok(mods) => {
                let already: HashSet<String> =
                    self.client.adapter_names().await.into_iter().collect();
                let wanted: Vec<String> = mods
                    .into_iter()
                    .filter(|summary| summary.requires_adapter)
                    .map(|summary| summary.name)
                    .filter(|name| !already.contains(name))
                    .collect();
                let (adapters, failures) = registry.load_adapters(&wanted);
                for failure in failures {
                    warn!(%failure, "adapter auto-load failed");
                }
                for adapter in adapters {
                    self.client.register_mod_adapter(adapter).await;
                }
            }
            Err(e) => warn!(error = %e, "could not list server mods"),
        }

        let mut reactor = match self.reactor.lock().await.take() {
            Some(reactor) => reactor,
            None => {
                return Err(NetworkError::Config("runner has no reactor".to_string()))
            }
        };
        if let Err(e) = reactor.setup(&self.client).await {
            error!(error = %e, "reactor setup failed");
            let _ = self.client.disconnect().await;
            self.state.send_replace(RunnerState::Stopped);
            return Err(e);
        }

        self.state.send_replace(RunnerState::Running);
        let handle = tokio::spawn(reaction_loop(
            self.client.clone(),
            reactor,
            self.interval,
            self.ignored_sender_ids.clone(),
            self.stop.subscribe(),
            self.state.clone(),
        ));
        *self.loop_handle.lock().await = Some(handle);
        info!(agent_id = %self.client.agent_id(), "agent runner started");
        Ok(())
    }

    /// Graceful stop: let the in-flight reaction finish, run teardown,
    /// disconnect. Idempotent.
    pub async fn stop(&self) {
        match self.state() {
            RunnerState::Stopping | RunnerState::Stopped | RunnerState::Init => return,
            RunnerState::Ready | RunnerState::Running => {}
        }
        self.state.send_replace(RunnerState::Stopping);
        self.stop.send_replace(true);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "reaction loop join failed");
            }
        }
        self.state.send_replace(RunnerState::Stopped);
        info!(agent_id = %self.client.agent_id(), "agent runner stopped");
    }

    /// Block until the runner reaches `Stopped`.
    pub async fn wait_for_stop(&self) {
        let mut state = self.state.subscribe();
        while *state.borrow() != RunnerState::Stopped {
            if state.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Pick the earliest unprocessed message across all threads.
fn select_unprocessed(
    threads: &HashMap<String, MessageThread>,
    processed: &HashSet<String>,
) -> Option<(String, Envelope)> {
    let mut chosen: Option<(String, Envelope)> = None;
    for (thread_id, thread) in threads {
        for message in thread.messages() {
            if processed.contains(message.message_id()) {
                continue;
            }
            let earlier = chosen
                .as_ref()
                .map(|(_, current)| message.timestamp() < current.timestamp())
                .unwrap_or(true);
            if earlier {
                chosen = Some((thread_id.clone(), message.clone()));
            }
        }
    }
    chosen
}

/// Restrict every thread to messages at or before `cutoff`.
fn filter_threads(
    threads: &HashMap<String, MessageThread>,
    cutoff: f64,
) -> HashMap<String, MessageThread> {
    threads
        .iter()
        .map(|(thread_id, thread)| (thread_id.clone(), thread.filtered_at(cutoff)))
        .collect()
}

async fn reaction_loop(
    client: AgentClient,
    mut reactor: Box<dyn AgentReactor>,
    interval: Duration,
    ignored_sender_ids: HashSet<String>,
    mut stop: watch::Receiver<bool>,
    state: watch::Sender<RunnerState>,
) {
    let mut processed: HashSet<String> = HashSet::new();

    loop {
        if *stop.borrow() {
            break;
        }

        let threads = client.get_message_threads().await;
        match select_unprocessed(&threads, &processed) {
            Some((thread_id, envelope)) => {
                processed.insert(envelope.message_id().to_string());

                if ignored_sender_ids.contains(envelope.sender_id()) {
                    debug!(sender = %envelope.sender_id(), "skipping ignored sender");
                    continue;
                }

                let filtered = filter_threads(&threads, envelope.timestamp());
                let message_id = envelope.message_id().to_string();
                let outcome = std::panic::AssertUnwindSafe(reactor.react(
                    filtered,
                    thread_id,
                    envelope,
                ))
                .catch_unwind()
                .await;
                if outcome.is_err() {
                    // The id stays in `processed`; the next sweep skips it.
                    error!(%message_id, "reactor panicked in react");
                }
                // Look for the next candidate immediately.
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.changed() => {}
                }
            }
        }
    }

    if let Err(e) = reactor.teardown(&client).await {
        error!(error = %e, "reactor teardown failed");
    }
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "disconnect during stop");
    }
    state.send_replace(RunnerState::Stopped);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::message::DirectMessage;

    fn thread_with(messages: Vec<(f64, &str)>) -> MessageThread {
        let mut thread = MessageThread::new();
        for (timestamp, id) in messages {
            let mut message = DirectMessage::new("a1", "a2", ContentMap::new());
            message.timestamp = timestamp;
            message.message_id = id.to_string();
            thread.push(Envelope::Direct(message));
        }
        thread
    }

    #[test]
    fn selects_earliest_unprocessed_across_threads() {
        let mut threads = HashMap::new();
        threads.insert("t1".to_string(), thread_with(vec![(5.0, "m5"), (1.0, "m1")]));
        threads.insert("t2".to_string(), thread_with(vec![(3.0, "m3")]));

        let mut processed = HashSet::new();
        let (thread_id, envelope) = select_unprocessed(&threads, &processed).unwrap();
        assert_eq!(thread_id, "t1");
        assert_eq!(envelope.message_id(), "m1");

        processed.insert("m1".to_string());
        let (thread_id, envelope) = select_unprocessed(&threads, &processed).unwrap();
        assert_eq!(thread_id, "t2");
        assert_eq!(envelope.message_id(), "m3");
    }

    #[test]
    fn select_returns_none_when_all_processed() {
        let mut threads = HashMap::new();
        threads.insert("t1".to_string(), thread_with(vec![(1.0, "m1")]));
        let processed: HashSet<String> = ["m1".to_string()].into_iter().collect();
        assert!(select_unprocessed(&threads, &processed).is_none());
    }

    #[test]
    fn filter_is_inclusive_of_cutoff() {
        let mut threads = HashMap::new();
        threads.insert(
            "t1".to_string(),
            thread_with(vec![(1.0, "m1"), (2.0, "m2"), (3.0, "m3")]),
        );
        let filtered = filter_threads(&threads, 2.0);
        let ids: Vec<&str> = filtered["t1"]
            .messages()
            .iter()
            .map(Envelope::message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        struct Noop;
        #[async_trait]
        impl AgentReactor for Noop {
            async fn react(
                &mut self,
                _threads: HashMap<String, MessageThread>,
                _thread_id: String,
                _envelope: Envelope,
            ) {
            }
        }
        let runner = AgentRunner::new(AgentClient::new("a1"), Box::new(Noop));
        assert_eq!(runner.state(), RunnerState::Init);
        runner.stop().await;
        assert_eq!(runner.state(), RunnerState::Init);
    }
}
