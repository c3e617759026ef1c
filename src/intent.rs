//! Rule-change intent detection for supervisor messages
//!
//! Decides whether an incoming supervisor message is an ordinary
//! contribution or a request to change the dispatch rules. Two passes: a
//! cheap fixed battery of phrase patterns, then (only for longer messages
//! that the battery missed) one strict YES/NO model call. Every ambiguous
//! or failed outcome resolves to `false` — dispatch rules are never
//! rewritten on a guess.

use crate::llm::{ChatRequest, LlmService};
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Messages shorter than this never reach the model pass; the battery is
/// the only judge for throwaway lines.
const MODEL_PASS_MIN_LEN: usize = 24;

const CLASSIFY_SYSTEM: &str =
    "You classify supervisor messages in a multi-agent conversation. Answer \
with exactly YES or NO: does the message ask to change who speaks next, how \
turns are routed, or when the supervisor should be involved? Output only \
YES or NO.";

fn pattern_battery() -> &'static [Regex] {
    static BATTERY: OnceLock<Vec<Regex>> = OnceLock::new();
    BATTERY.get_or_init(|| {
        [
            // Restrict notifications
            r"(?i)\bonly (?:involve|notify|ping|include|bother) me\b",
            r"(?i)\bdon'?t (?:notify|ping|involve|bother) me (?:unless|until)\b",
            r"(?i)\bnotify me (?:only )?when\b",
            // Conditional routing
            r"(?i)\bif\b.{1,80}\b(?:ask|route (?:it )?to|send (?:it )?to)\b",
            r"(?i)\bwhen(?:ever)?\b.{1,80}\bhand (?:it )?(?:to|off)\b",
            // Agent preference
            r"(?i)\balways (?:ask|use|route to|prefer)\b",
            r"(?i)\bprefer\b.{1,60}\b(?:over|instead of)\b",
            r"(?i)\blet (?:the )?\w+ (?:handle|take|answer)\b",
            // Rule-change phrasing
            r"(?i)\bfrom now on\b",
            r"(?i)\bgoing forward\b",
            r"(?i)\bnew rule\b",
            r"(?i)\bchange the (?:rules|routing|order)\b",
            r"(?i)\bstop (?:asking|routing|pinging)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("intent pattern must compile"))
        .collect()
    })
}

/// Two-pass classifier for dispatch-rule-change intent.
pub struct IntentClassifier {
    service: Option<Arc<dyn LlmService>>,
}

impl IntentClassifier {
    pub fn new(service: Option<Arc<dyn LlmService>>) -> Self {
        Self { service }
    }

    /// Pattern-only classifier, for deployments without a model.
    pub fn pattern_only() -> Self {
        Self { service: None }
    }

    pub async fn classifies(&self, text: &str) -> bool {
        if pattern_battery().iter().any(|p| p.is_match(text)) {
            return true;
        }

        if text.len() < MODEL_PASS_MIN_LEN {
            return false;
        }
        let Some(service) = &self.service else {
            return false;
        };

        let request = ChatRequest::single(CLASSIFY_SYSTEM, format!("Message: {text}"), 5);
        match service.complete(&request).await {
            Ok(response) => {
                let verdict = response.text.trim();
                verdict.eq_ignore_ascii_case("yes")
            }
            Err(e) => {
                tracing::debug!(error = %e, "intent classification call failed, assuming no");
                false
            }
        }
    }
}
