//! Graph-constrained speaker selection
//!
//! Each turn, the transition graph narrows the full roster to the legal
//! candidate set for whoever spoke last. The selection delegate only ever
//! sees that narrowed slice, so the full roster cannot leak into a turn;
//! whatever it answers is validated against the same set before it is
//! trusted. An invalid or failed selection falls back to the first legal
//! candidate in graph order, loudly.

use crate::conversation::{last_speaker, ThreadEvent};
use crate::llm::{ChatRequest, LlmError, LlmService};
use crate::roster::{Participant, Roster, TransitionGraph, CONVERSATION_START};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The transition graph has no entry at all for the last speaker.
    /// A silent default here would paper over a broken graph, so this is
    /// fatal to the turn.
    #[error("transition graph has no entry for speaker '{speaker}'")]
    MissingTransition { speaker: String },

    /// The graph entry exists but names nobody present in the roster.
    #[error("no legal candidates in the roster for speaker '{speaker}'")]
    NoCandidates { speaker: String },
}

/// Selection delegate. Gets the narrowed candidate roster for this turn
/// plus the thread, answers with a candidate name or nothing.
#[async_trait]
pub trait SpeakerSelectionStrategy: Send + Sync {
    async fn select(
        &self,
        candidates: &[&Participant],
        thread: &[ThreadEvent],
    ) -> Result<Option<String>, LlmError>;
}

/// Picks the next speaker for a turn.
pub struct SpeakerScheduler {
    roster: Roster,
    strategy: Arc<dyn SpeakerSelectionStrategy>,
}

impl SpeakerScheduler {
    pub fn new(roster: Roster, strategy: Arc<dyn SpeakerSelectionStrategy>) -> Self {
        Self { roster, strategy }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Select the next speaker after the thread's last chat message. An
    /// empty thread selects from the graph's conversation-start entry.
    pub async fn select_next(
        &self,
        graph: &TransitionGraph,
        thread: &[ThreadEvent],
    ) -> Result<String, SchedulerError> {
        let speaker = last_speaker(thread).unwrap_or(CONVERSATION_START);

        let successors = graph
            .successors(speaker)
            .ok_or_else(|| SchedulerError::MissingTransition {
                speaker: speaker.to_string(),
            })?;

        let candidates = self.roster.narrow(successors);
        let Some(first) = candidates.first() else {
            return Err(SchedulerError::NoCandidates {
                speaker: speaker.to_string(),
            });
        };
        let fallback = first.name.clone();

        match self.strategy.select(&candidates, thread).await {
            Ok(Some(name)) if candidates.iter().any(|p| p.name == name) => Ok(name),
            Ok(Some(name)) => {
                tracing::warn!(
                    proposed = %name,
                    fallback = %fallback,
                    after = %speaker,
                    "selection delegate proposed a speaker outside the legal set"
                );
                Ok(fallback)
            }
            Ok(None) => {
                tracing::debug!(
                    fallback = %fallback,
                    after = %speaker,
                    "selection delegate abstained"
                );
                Ok(fallback)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = %fallback,
                    after = %speaker,
                    "selection delegate failed"
                );
                Ok(fallback)
            }
        }
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// Pattern-based selection: scores candidates by how many of their
/// capability words appear in the last chat message. No I/O.
pub struct KeywordStrategy;

#[async_trait]
impl SpeakerSelectionStrategy for KeywordStrategy {
    async fn select(
        &self,
        candidates: &[&Participant],
        thread: &[ThreadEvent],
    ) -> Result<Option<String>, LlmError> {
        let Some(ThreadEvent::ChatMessage { content, .. }) =
            thread.iter().rev().find(|e| e.is_chat())
        else {
            return Ok(None);
        };
        let haystack = content.to_lowercase();

        let mut best: Option<(&Participant, usize)> = None;
        for candidate in candidates {
            let score = candidate
                .capabilities
                .to_lowercase()
                .split_whitespace()
                .filter(|word| word.len() > 3 && haystack.contains(word))
                .count();
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate, score));
            }
        }

        Ok(best.map(|(p, _)| p.name.clone()))
    }
}

const SELECTION_SYSTEM: &str = "You route turns in a multi-participant conversation. \
Reply with exactly one name from the candidate list. Output only the name, \
no punctuation or explanation.";

/// How many trailing chat messages the model sees when routing.
const SELECTION_CONTEXT_MESSAGES: usize = 12;

/// Model-backed selection with a strict name-only reply protocol.
pub struct ModelStrategy {
    service: Arc<dyn LlmService>,
}

impl ModelStrategy {
    pub fn new(service: Arc<dyn LlmService>) -> Self {
        Self { service }
    }

    fn build_prompt(candidates: &[&Participant], thread: &[ThreadEvent]) -> String {
        use std::fmt::Write;

        let mut prompt = String::from("Candidates:\n");
        for candidate in candidates {
            let _ = writeln!(prompt, "- {}: {}", candidate.name, candidate.capabilities);
        }
        prompt.push_str("\nConversation so far:\n");
        let tail: Vec<&ThreadEvent> = thread
            .iter()
            .filter(|e| e.is_chat())
            .rev()
            .take(SELECTION_CONTEXT_MESSAGES)
            .collect();
        for event in tail.into_iter().rev() {
            if let ThreadEvent::ChatMessage { source, content } = event {
                let _ = writeln!(prompt, "{source}: {content}");
            }
        }
        prompt.push_str("\nWho should speak next?");
        prompt
    }
}

#[async_trait]
impl SpeakerSelectionStrategy for ModelStrategy {
    async fn select(
        &self,
        candidates: &[&Participant],
        thread: &[ThreadEvent],
    ) -> Result<Option<String>, LlmError> {
        let prompt = Self::build_prompt(candidates, thread);
        let request = ChatRequest::single(SELECTION_SYSTEM, prompt, 30);
        let response = self.service.complete(&request).await?;

        // First non-empty line of the reply; the scheduler validates
        // membership against the candidate set.
        let name = response
            .text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(ToString::to_string);
        Ok(name)
    }
}
