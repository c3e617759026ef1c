//! Session ownership and viewer fan-out
//!
//! One [`Session`] owns a conversation tree, its run loop, and the set of
//! live viewer connections. The [`SessionRegistry`] hands out sessions
//! idempotently, and a periodic sweep tears down sessions that have sat
//! with zero viewers past the idle timeout — re-checking the connection
//! count at the last moment so a reconnection that raced the sweep wins.

use crate::config::Config;
use crate::conversation::{ConversationTree, TreeSnapshot};
use crate::input::{InputCorrelator, InputRequestNotice};
use crate::intent::IntentClassifier;
use crate::llm::LlmService;
use crate::roster::{ParticipantKind, Roster, TransitionGraph};
use crate::runloop::{
    LlmParticipant, LoopCommand, LoopEvent, ModelRuleRewriter, ParticipantAgent, RedirectMessage,
    RuleRewriter, RunLoop, RunLoopHandle,
};
use crate::scheduler::{KeywordStrategy, ModelStrategy, SpeakerScheduler, SpeakerSelectionStrategy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// What a session needs to come to life: who talks, and who may follow whom.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub roster: Roster,
    pub graph: TransitionGraph,
}

/// Messages fanned out to every attached viewer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    AgentMessage {
        agent_name: String,
        content: String,
        node_id: String,
    },
    AgentInputRequest {
        request_id: String,
        prompt: String,
        agent_name: String,
    },
    TreeUpdate {
        #[serde(flatten)]
        snapshot: TreeSnapshot,
    },
    Error {
        message: String,
    },
}

pub type ConnectionId = uuid::Uuid;

/// One live conversation shared by any number of viewer connections.
pub struct Session {
    pub id: String,
    tree: Arc<Mutex<ConversationTree>>,
    pub correlator: Arc<InputCorrelator>,
    handle: RunLoopHandle,
    shutdown: CancellationToken,
    connections: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<ViewerEvent>>>,
    idle_since: Mutex<Option<Instant>>,
}

impl Session {
    fn start(id: &str, spec: &SessionSpec, llm: Option<Arc<dyn LlmService>>, config: &Config) -> Arc<Self> {
        let tree = Arc::new(Mutex::new(ConversationTree::new()));
        let correlator = Arc::new(InputCorrelator::new());
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let strategy: Arc<dyn SpeakerSelectionStrategy> = match &llm {
            Some(service) => Arc::new(ModelStrategy::new(service.clone())),
            None => Arc::new(KeywordStrategy),
        };
        let scheduler = SpeakerScheduler::new(spec.roster.clone(), strategy);
        let classifier = IntentClassifier::new(llm.clone());
        let rewriter: Option<Arc<dyn RuleRewriter>> = llm
            .as_ref()
            .map(|service| Arc::new(ModelRuleRewriter::new(service.clone())) as _);

        let agents: Vec<Arc<dyn ParticipantAgent>> = match &llm {
            Some(service) => spec
                .roster
                .iter()
                .filter(|p| p.kind == ParticipantKind::Automated)
                .map(|p| {
                    Arc::new(LlmParticipant::new(p.clone(), service.clone()))
                        as Arc<dyn ParticipantAgent>
                })
                .collect(),
            None => Vec::new(),
        };

        let (run_loop, handle) = RunLoop::new(
            id.to_string(),
            scheduler,
            spec.graph.clone(),
            agents,
            tree.clone(),
            correlator.clone(),
            classifier,
            rewriter,
            events_tx,
            shutdown.clone(),
            config.max_round_turns,
        );
        tokio::spawn(run_loop.run());

        let session = Arc::new(Self {
            id: id.to_string(),
            tree,
            correlator: correlator.clone(),
            handle,
            shutdown,
            connections: Mutex::new(HashMap::new()),
            idle_since: Mutex::new(Some(Instant::now())),
        });

        // Input requests surface to viewers through the session's own
        // fan-out. Weak: the correlator must not keep the session alive.
        let weak = Arc::downgrade(&session);
        correlator.bind_transport(Arc::new(move |notice: InputRequestNotice| {
            if let Some(session) = weak.upgrade() {
                session.broadcast(
                    ViewerEvent::AgentInputRequest {
                        request_id: notice.request_id,
                        prompt: notice.prompt,
                        agent_name: notice.requester,
                    },
                    None,
                );
            }
        }));

        // Pump run-loop events into the fan-out. Ends when the run loop
        // drops its sender at shutdown.
        let pump = Arc::downgrade(&session);
        tokio::spawn(async move {
            let mut events_rx = events_rx;
            while let Some(event) = events_rx.recv().await {
                let Some(session) = pump.upgrade() else { break };
                session.broadcast(ViewerEvent::from(event), None);
            }
        });

        session
    }

    /// Add a viewer. Clears any idle stamp.
    pub fn attach(&self, sender: mpsc::UnboundedSender<ViewerEvent>) -> ConnectionId {
        let id = uuid::Uuid::new_v4();
        self.connections.lock().unwrap().insert(id, sender);
        self.idle_since.lock().unwrap().take();
        tracing::debug!(session_id = %self.id, connection = %id, "viewer attached");
        id
    }

    /// Remove a viewer. The last one out stamps the idle clock for the
    /// sweeper; pending input requests for this session are cancelled.
    pub fn detach(&self, connection: ConnectionId) {
        let remaining = {
            let mut connections = self.connections.lock().unwrap();
            connections.remove(&connection);
            connections.len()
        };
        tracing::debug!(session_id = %self.id, connection = %connection, remaining, "viewer detached");
        if remaining == 0 {
            *self.idle_since.lock().unwrap() = Some(Instant::now());
            self.correlator.cancel_all();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Send to every attached viewer except `exclude`. A failed send
    /// evicts that connection; the rest of the fan-out continues.
    pub fn broadcast(&self, event: ViewerEvent, exclude: Option<ConnectionId>) {
        let mut dead = Vec::new();
        {
            let connections = self.connections.lock().unwrap();
            for (id, sender) in connections.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                if sender.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            tracing::debug!(session_id = %self.id, connection = %id, "evicting dead viewer connection");
            self.detach(id);
        }
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.tree.lock().unwrap().snapshot()
    }

    /// Forward a supervisor redirect to the run loop.
    pub async fn send_directed(&self, message: RedirectMessage) {
        if !self.handle.send(LoopCommand::Directed(message)).await {
            tracing::warn!(session_id = %self.id, "run loop is gone, dropping directed message");
        }
    }

    /// Cancel the turn in flight.
    pub fn interrupt(&self) {
        self.handle.interrupt();
    }

    /// Answer a pending input request. `false` means the id was unknown
    /// or already settled.
    pub fn resolve_input(&self, request_id: &str, value: &str) -> bool {
        self.correlator.resolve(request_id, value)
    }

    fn idle_for(&self) -> Option<std::time::Duration> {
        self.idle_since.lock().unwrap().map(|since| since.elapsed())
    }

    fn teardown(&self) {
        tracing::info!(session_id = %self.id, "tearing down session");
        self.shutdown.cancel();
        self.correlator.cancel_all();
    }
}

impl From<LoopEvent> for ViewerEvent {
    fn from(event: LoopEvent) -> Self {
        match event {
            LoopEvent::AgentMessage {
                agent_name,
                content,
                node_id,
            } => ViewerEvent::AgentMessage {
                agent_name,
                content,
                node_id,
            },
            LoopEvent::TreeUpdate(snapshot) => ViewerEvent::TreeUpdate { snapshot },
            LoopEvent::Error { message } => ViewerEvent::Error { message },
        }
    }
}

/// Owner of every live session.
pub struct SessionRegistry {
    config: Config,
    llm: Option<Arc<dyn LlmService>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: Config, llm: Option<Arc<dyn LlmService>>) -> Self {
        Self {
            config,
            llm,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the session for an id. Idempotent: the first caller
    /// constructs it, later callers for the same id share the instance
    /// regardless of the spec they pass.
    pub async fn get_or_create(&self, session_id: &str, spec: &SessionSpec) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            return session.clone();
        }
        tracing::info!(session_id, "creating session");
        let session = Session::start(session_id, spec, self.llm.clone(), &self.config);
        sessions.insert(session_id.to_string(), session.clone());
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Tear down sessions that have had zero viewers for longer than the
    /// idle timeout. The connection count is re-checked under the write
    /// lock immediately before removal, so an attach that landed between
    /// the idle check and here keeps the session alive.
    pub async fn sweep(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, session)| {
                    session.connection_count() == 0
                        && session
                            .idle_for()
                            .is_some_and(|idle| idle >= self.config.idle_timeout)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        let mut sessions = self.sessions.write().await;
        for id in expired {
            let still_expired = sessions.get(&id).is_some_and(|session| {
                session.connection_count() == 0
                    && session
                        .idle_for()
                        .is_some_and(|idle| idle >= self.config.idle_timeout)
            });
            if still_expired {
                if let Some(session) = sessions.remove(&id) {
                    session.teardown();
                }
            }
        }
    }

    /// Periodic sweeping until the token is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => self.sweep().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Participant;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn test_spec() -> SessionSpec {
        let roster = Roster::new(vec![
            Participant::automated("assistant", "answers questions"),
            Participant::human_proxy("operator", "the supervisor"),
        ]);
        let graph = TransitionGraph::fully_connected(&roster);
        SessionSpec { roster, graph }
    }

    fn test_registry(idle_timeout: Duration) -> SessionRegistry {
        let config = Config {
            idle_timeout,
            ..Config::default()
        };
        SessionRegistry::new(config, None)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = test_registry(Duration::from_secs(300));
        let spec = test_spec();

        let first = registry.get_or_create("s1", &spec).await;
        let second = registry.get_or_create("s1", &spec).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.session_ids().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_and_self_heals() {
        let registry = test_registry(Duration::from_secs(300));
        let session = registry.get_or_create("s1", &test_spec()).await;

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();

        let a = session.attach(tx_a);
        let _b = session.attach(tx_b);
        let _dead = session.attach(tx_dead);
        drop(rx_dead);
        assert_eq!(session.connection_count(), 3);

        session.broadcast(
            ViewerEvent::Error {
                message: "hello".to_string(),
            },
            Some(a),
        );

        // Excluded viewer got nothing.
        assert!(rx_a.try_recv().is_err());
        // Live viewer got the event.
        assert!(matches!(
            rx_b.try_recv(),
            Ok(ViewerEvent::Error { .. })
        ));
        // The dead connection was evicted without aborting the fan-out.
        assert_eq!(session.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_respects_idle_timeout_and_reattach() {
        let registry = test_registry(Duration::from_millis(50));
        let session = registry.get_or_create("s1", &test_spec()).await;

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let c1 = session.attach(tx1);
        let c2 = session.attach(tx2);

        session.detach(c1);
        session.detach(c2);

        // Idle, but not yet past the timeout: survives.
        registry.sweep().await;
        assert!(registry.get("s1").await.is_some());

        // An attach between expiry and sweep keeps the session alive.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let (tx3, _rx3) = mpsc::unbounded_channel();
        let c3 = session.attach(tx3);
        registry.sweep().await;
        assert!(registry.get("s1").await.is_some());

        // Fully idle past the timeout: removed.
        session.detach(c3);
        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.sweep().await;
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending_input() {
        let registry = test_registry(Duration::from_millis(10));
        let session = registry.get_or_create("s1", &test_spec()).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let c = session.attach(tx);

        // Register a pending input request directly on the correlator.
        let correlator = session.correlator.clone();
        let cancel = CancellationToken::new();
        let waiter = tokio::spawn(async move {
            correlator.request("question", "operator", &cancel).await
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !session.correlator.has_pending() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        session.detach(c);
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.sweep().await;

        assert!(registry.get("s1").await.is_none());
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(session.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_input_request_reaches_viewers() {
        let registry = test_registry(Duration::from_secs(300));
        let session = registry.get_or_create("s1", &test_spec()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach(tx);

        let correlator = session.correlator.clone();
        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { correlator.request("pick one", "operator", &cancel).await })
        };

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let request_id = match event {
            ViewerEvent::AgentInputRequest {
                request_id,
                prompt,
                agent_name,
            } => {
                assert_eq!(prompt, "pick one");
                assert_eq!(agent_name, "operator");
                request_id
            }
            other => panic!("expected input request, got {other:?}"),
        };

        assert!(session.resolve_input(&request_id, "the first"));
        assert_eq!(waiter.await.unwrap(), Ok("the first".to_string()));
    }
}
