//! The turn-driving run loop for one session
//!
//! Supervisor messages arrive as commands; each one may rewind history
//! onto a new branch, is checked for dispatch-rule-change intent, and then
//! drives a bounded round of turns: the scheduler picks a legal speaker,
//! automated participants produce events, human-proxy participants suspend
//! on the input correlator. An interrupt cancels the round token, which
//! propagates into whatever the round was awaiting.

use crate::conversation::{trim, ConversationTree, ThreadEvent, TreeSnapshot};
use crate::input::{InputCorrelator, InputError};
use crate::intent::IntentClassifier;
use crate::llm::{ChatRequest, ChatRole, ChatTurn, LlmError, LlmService};
use crate::roster::{Participant, ParticipantKind, Roster, TransitionGraph};
use crate::scheduler::SpeakerScheduler;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A supervisor message redirecting the conversation.
#[derive(Debug, Clone)]
pub struct RedirectMessage {
    pub content: String,
    /// Participant who must take the first turn of the round.
    pub target: String,
    /// Logical nodes to rewind before forking; 0 forks at the frontier.
    pub trim_count: usize,
}

/// Commands accepted by the run loop.
#[derive(Debug)]
pub enum LoopCommand {
    Directed(RedirectMessage),
}

/// Events the run loop emits toward the session's viewers.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    AgentMessage {
        agent_name: String,
        content: String,
        node_id: String,
    },
    TreeUpdate(TreeSnapshot),
    Error {
        message: String,
    },
}

/// One automated (or scripted) participant the run loop can drive.
///
/// Agents keep a participant-local chat buffer: they observe every chat
/// message that becomes part of the shared history and never see tool
/// entries, which is why rewinds trim them by chat count rather than by
/// node or entry count.
#[async_trait]
pub trait ParticipantAgent: Send + Sync {
    fn name(&self) -> &str;

    /// A chat message was appended to the shared history.
    fn observe(&self, source: &str, content: &str);

    /// Drop the last `chat_count` messages from the local buffer.
    fn trim_history(&self, chat_count: usize);

    /// Produce this participant's turn.
    async fn take_turn(&self) -> Result<Vec<ThreadEvent>, LlmError>;
}

/// Rewrites the transition graph when the supervisor asks for new
/// dispatch rules. Failure keeps the current graph.
#[async_trait]
pub trait RuleRewriter: Send + Sync {
    async fn rewrite(
        &self,
        current: &TransitionGraph,
        roster: &Roster,
        instruction: &str,
    ) -> Result<TransitionGraph, LlmError>;
}

/// Handle for feeding and interrupting a running loop.
#[derive(Clone)]
pub struct RunLoopHandle {
    cmd_tx: mpsc::Sender<LoopCommand>,
    current_round: Arc<Mutex<Option<CancellationToken>>>,
}

impl RunLoopHandle {
    pub async fn send(&self, command: LoopCommand) -> bool {
        self.cmd_tx.send(command).await.is_ok()
    }

    /// Cancel the round in flight, if any. Pending input requests the
    /// round was awaiting are removed as if externally cancelled.
    pub fn interrupt(&self) {
        if let Some(token) = self.current_round.lock().unwrap().take() {
            tracing::info!("interrupting current round");
            token.cancel();
        }
    }
}

/// The run loop itself. Owns the thread mirror and the transition graph;
/// shares the tree with the session that snapshots it for late joiners.
pub struct RunLoop {
    session_id: String,
    scheduler: SpeakerScheduler,
    graph: TransitionGraph,
    agents: HashMap<String, Arc<dyn ParticipantAgent>>,
    supervisor: String,
    tree: Arc<Mutex<ConversationTree>>,
    thread: Vec<ThreadEvent>,
    correlator: Arc<InputCorrelator>,
    classifier: IntentClassifier,
    rewriter: Option<Arc<dyn RuleRewriter>>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    cmd_rx: mpsc::Receiver<LoopCommand>,
    current_round: Arc<Mutex<Option<CancellationToken>>>,
    shutdown: CancellationToken,
    max_round_turns: usize,
}

impl RunLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        scheduler: SpeakerScheduler,
        graph: TransitionGraph,
        agents: Vec<Arc<dyn ParticipantAgent>>,
        tree: Arc<Mutex<ConversationTree>>,
        correlator: Arc<InputCorrelator>,
        classifier: IntentClassifier,
        rewriter: Option<Arc<dyn RuleRewriter>>,
        events_tx: mpsc::UnboundedSender<LoopEvent>,
        shutdown: CancellationToken,
        max_round_turns: usize,
    ) -> (Self, RunLoopHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let current_round = Arc::new(Mutex::new(None));

        let supervisor = scheduler
            .roster()
            .iter()
            .find(|p| p.kind == ParticipantKind::HumanProxy)
            .map_or_else(|| "supervisor".to_string(), |p| p.name.clone());

        let agents = agents
            .into_iter()
            .map(|agent| (agent.name().to_string(), agent))
            .collect();

        let run_loop = Self {
            session_id,
            scheduler,
            graph,
            agents,
            supervisor,
            tree,
            thread: Vec::new(),
            correlator,
            classifier,
            rewriter,
            events_tx,
            cmd_rx,
            current_round: current_round.clone(),
            shutdown,
            max_round_turns,
        };
        let handle = RunLoopHandle {
            cmd_tx,
            current_round,
        };
        (run_loop, handle)
    }

    pub async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, "run loop started");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                command = self.cmd_rx.recv() => match command {
                    Some(LoopCommand::Directed(message)) => {
                        self.handle_directed(message).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!(session_id = %self.session_id, "run loop stopped");
    }

    async fn handle_directed(&mut self, message: RedirectMessage) {
        if !self.scheduler.roster().contains(&message.target) {
            self.report_error(format!(
                "redirect refused: unknown participant '{}'",
                message.target
            ));
            return;
        }

        // Rewind + fork first; a failed translation refuses the redirect
        // with all state untouched.
        if !self.rewind_and_fork(message.trim_count) {
            return;
        }

        self.append_and_broadcast(ThreadEvent::chat(
            self.supervisor.clone(),
            message.content.clone(),
        ));

        if self.classifier.classifies(&message.content).await {
            self.rewrite_rules(&message.content).await;
        }

        let round = CancellationToken::new();
        *self.current_round.lock().unwrap() = Some(round.clone());
        self.drive_round(&message.target, &round).await;
        self.current_round.lock().unwrap().take();
    }

    /// Translate the rewind, fork the tree, and trim the thread mirror and
    /// every participant-local buffer. Returns false when the redirect was
    /// refused.
    fn rewind_and_fork(&mut self, trim_count: usize) -> bool {
        let (entries, chat_count) = match (
            trim::entries_for_last_nodes(&self.thread, trim_count),
            trim::chat_count_for_last_nodes(&self.thread, trim_count),
        ) {
            (Ok(entries), Ok(chat_count)) => (entries, chat_count),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "redirect refused");
                self.report_error(format!("redirect refused: {e}"));
                return false;
            }
        };

        let branch_id = format!("branch-{}", uuid::Uuid::new_v4());
        let forked = {
            let mut tree = self.tree.lock().unwrap();
            tree.rewind_target(trim_count)
                .and_then(|ancestor| tree.fork(&ancestor, &branch_id))
        };
        if let Err(e) = forked {
            tracing::warn!(session_id = %self.session_id, error = %e, "redirect refused");
            self.report_error(format!("redirect refused: {e}"));
            return false;
        }

        self.thread.truncate(self.thread.len() - entries);
        if chat_count > 0 {
            for agent in self.agents.values() {
                agent.trim_history(chat_count);
            }
        }
        self.broadcast_tree();
        true
    }

    async fn rewrite_rules(&mut self, instruction: &str) {
        let Some(rewriter) = &self.rewriter else {
            tracing::debug!("rule-change intent detected but no rewriter configured");
            return;
        };
        match rewriter
            .rewrite(&self.graph, self.scheduler.roster(), instruction)
            .await
        {
            Ok(graph) if graph.is_consistent_with(self.scheduler.roster()) => {
                tracing::info!(session_id = %self.session_id, "transition graph rewritten");
                self.graph = graph;
            }
            Ok(_) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    "rewritten graph references unknown participants, keeping current rules"
                );
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "rule rewrite failed, keeping current rules"
                );
            }
        }
    }

    async fn drive_round(&mut self, target: &str, round: &CancellationToken) {
        for turn in 0..self.max_round_turns {
            if round.is_cancelled() {
                break;
            }

            let speaker = if turn == 0 {
                // The redirect names the first speaker; the graph governs
                // everyone after that.
                target.to_string()
            } else {
                let selected = tokio::select! {
                    () = round.cancelled() => break,
                    selected = self.scheduler.select_next(&self.graph, &self.thread) => selected,
                };
                match selected {
                    Ok(name) => name,
                    Err(e) => {
                        self.report_error(e.to_string());
                        break;
                    }
                }
            };

            let Some(participant) = self.scheduler.roster().get(&speaker).cloned() else {
                self.report_error(format!("selected speaker '{speaker}' is not in the roster"));
                break;
            };

            let finished = match participant.kind {
                ParticipantKind::HumanProxy => self.human_turn(&participant, round).await,
                ParticipantKind::Automated => self.automated_turn(&participant, round).await,
            };
            if finished {
                break;
            }
        }
    }

    /// Returns true when the round should end.
    async fn human_turn(&mut self, participant: &Participant, round: &CancellationToken) -> bool {
        let prompt = self
            .thread
            .iter()
            .rev()
            .find_map(|e| match e {
                ThreadEvent::ChatMessage { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "Your turn to speak.".to_string());

        match self
            .correlator
            .request(prompt, participant.name.clone(), round)
            .await
        {
            Ok(answer) => {
                self.append_and_broadcast(ThreadEvent::chat(participant.name.clone(), answer));
                false
            }
            Err(InputError::Cancelled(_)) => {
                tracing::info!(participant = %participant.name, "human turn interrupted");
                true
            }
            Err(e @ InputError::NoTransport) => {
                self.report_error(e.to_string());
                true
            }
        }
    }

    /// Returns true when the round should end.
    async fn automated_turn(
        &mut self,
        participant: &Participant,
        round: &CancellationToken,
    ) -> bool {
        let Some(agent) = self.agents.get(&participant.name).cloned() else {
            self.report_error(format!(
                "no agent bound for participant '{}'",
                participant.name
            ));
            return true;
        };

        let events = tokio::select! {
            () = round.cancelled() => return true,
            events = agent.take_turn() => events,
        };

        match events {
            Ok(events) => {
                for event in events {
                    if !self.append_and_broadcast(event) {
                        return true;
                    }
                }
                false
            }
            Err(e) => {
                tracing::warn!(
                    participant = %participant.name,
                    error = %e,
                    "participant turn failed"
                );
                self.report_error(format!("{} could not take its turn", participant.name));
                true
            }
        }
    }

    /// Append one event to the tree and the thread mirror, let every agent
    /// observe chat content, and notify viewers. Returns false when the
    /// event was rejected (broken tool pairing).
    fn append_and_broadcast(&mut self, event: ThreadEvent) -> bool {
        let appended = self.tree.lock().unwrap().append(event.clone());
        let node = match appended {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "event rejected");
                self.report_error(e.to_string());
                return false;
            }
        };

        self.thread.push(event.clone());

        if let ThreadEvent::ChatMessage { source, content } = &event {
            for agent in self.agents.values() {
                agent.observe(source, content);
            }
            if let Some(node) = &node {
                let _ = self.events_tx.send(LoopEvent::AgentMessage {
                    agent_name: source.clone(),
                    content: content.clone(),
                    node_id: node.id.clone(),
                });
            }
        }

        if node.is_some() {
            self.broadcast_tree();
        }
        true
    }

    fn broadcast_tree(&self) {
        let snapshot = self.tree.lock().unwrap().snapshot();
        let _ = self.events_tx.send(LoopEvent::TreeUpdate(snapshot));
    }

    fn report_error(&self, message: String) {
        let _ = self.events_tx.send(LoopEvent::Error { message });
    }
}

// ============================================================================
// Production delegates
// ============================================================================

/// LLM-backed automated participant with its own chat-only transcript.
pub struct LlmParticipant {
    participant: Participant,
    service: Arc<dyn LlmService>,
    history: Mutex<Vec<(String, String)>>,
    max_tokens: u32,
}

impl LlmParticipant {
    pub fn new(participant: Participant, service: Arc<dyn LlmService>) -> Self {
        Self {
            participant,
            service,
            history: Mutex::new(Vec::new()),
            max_tokens: 1024,
        }
    }
}

#[async_trait]
impl ParticipantAgent for LlmParticipant {
    fn name(&self) -> &str {
        &self.participant.name
    }

    fn observe(&self, source: &str, content: &str) {
        self.history
            .lock()
            .unwrap()
            .push((source.to_string(), content.to_string()));
    }

    fn trim_history(&self, chat_count: usize) {
        let mut history = self.history.lock().unwrap();
        let keep = history.len().saturating_sub(chat_count);
        history.truncate(keep);
    }

    async fn take_turn(&self) -> Result<Vec<ThreadEvent>, LlmError> {
        let system = format!(
            "You are {} in a group conversation. {}",
            self.participant.name, self.participant.capabilities
        );
        let messages: Vec<ChatTurn> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .map(|(source, content)| ChatTurn {
                role: if *source == self.participant.name {
                    ChatRole::Assistant
                } else {
                    ChatRole::User
                },
                content: if *source == self.participant.name {
                    content.clone()
                } else {
                    format!("{source}: {content}")
                },
            })
            .collect();

        let request = ChatRequest {
            system,
            messages,
            max_tokens: self.max_tokens,
        };
        let response = self.service.complete(&request).await?;
        Ok(vec![ThreadEvent::chat(
            self.participant.name.clone(),
            response.text,
        )])
    }
}

const REWRITE_SYSTEM: &str = "You maintain the speaker transition rules of a \
multi-participant conversation. Given the current rules, the participant \
names, and an instruction, output the complete new rules as a single JSON \
object mapping each speaker name to the array of names allowed to speak \
after it. Output only the JSON object.";

/// Model-backed rule rewriter with a strict JSON adjacency protocol.
pub struct ModelRuleRewriter {
    service: Arc<dyn LlmService>,
}

impl ModelRuleRewriter {
    pub fn new(service: Arc<dyn LlmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RuleRewriter for ModelRuleRewriter {
    async fn rewrite(
        &self,
        current: &TransitionGraph,
        roster: &Roster,
        instruction: &str,
    ) -> Result<TransitionGraph, LlmError> {
        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        let current_json = serde_json::to_string(current)
            .map_err(|e| LlmError::unknown(format!("graph serialization failed: {e}")))?;
        let prompt = format!(
            "Participants: {names:?}\nCurrent rules: {current_json}\nInstruction: {instruction}"
        );

        let request = ChatRequest::single(REWRITE_SYSTEM, prompt, 1024);
        let response = self.service.complete(&request).await?;

        let text = response.text.trim();
        // Tolerate a fenced reply; the protocol says bare JSON.
        let text = text
            .strip_prefix("```json")
            .or_else(|| text.strip_prefix("```"))
            .map_or(text, |inner| inner.trim_end_matches("```"))
            .trim();

        serde_json::from_str(text)
            .map_err(|e| LlmError::invalid_request(format!("malformed rules reply: {e}")))
    }
}
