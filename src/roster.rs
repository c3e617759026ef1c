//! Participant roster and the speaker transition graph

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Virtual speaker name the transition graph uses for the opening turn,
/// before anyone has spoken.
pub const CONVERSATION_START: &str = "__start__";

/// What kind of entity sits behind a participant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    /// Turns are produced by an automated agent (typically LLM-driven).
    Automated,
    /// Turns are produced by a human answering input requests.
    HumanProxy,
}

/// One member of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Unique name; also the key into the transition graph.
    pub name: String,
    /// Free-form capability blurb, consulted during speaker selection.
    pub capabilities: String,
    pub kind: ParticipantKind,
}

impl Participant {
    pub fn automated(name: impl Into<String>, capabilities: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into(),
            kind: ParticipantKind::Automated,
        }
    }

    pub fn human_proxy(name: impl Into<String>, capabilities: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into(),
            kind: ParticipantKind::HumanProxy,
        }
    }
}

/// The full participant roster, in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self { participants }
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    /// The sub-roster for a candidate name list, preserving candidate order.
    /// Names not present in the roster are skipped.
    pub fn narrow(&self, candidates: &[String]) -> Vec<&Participant> {
        candidates
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }
}

/// Adjacency mapping from a speaker to the ordered list of speakers legally
/// allowed to follow it. The [`CONVERSATION_START`] entry seeds the opening
/// turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionGraph {
    edges: HashMap<String, Vec<String>>,
}

impl TransitionGraph {
    /// Build a graph from `(speaker, allowed successors)` pairs.
    pub fn from_edges<I, S>(edges: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<S>)>,
        S: Into<String>,
    {
        let edges = edges
            .into_iter()
            .map(|(from, to)| (from.into(), to.into_iter().map(Into::into).collect()))
            .collect();
        Self { edges }
    }

    /// Fully connected graph over the roster: anyone may follow anyone,
    /// and anyone may open. Successor order follows roster order.
    pub fn fully_connected(roster: &Roster) -> Self {
        let names: Vec<String> = roster.iter().map(|p| p.name.clone()).collect();
        let mut edges: HashMap<String, Vec<String>> = names
            .iter()
            .map(|name| {
                let successors = names.iter().filter(|n| *n != name).cloned().collect();
                (name.clone(), successors)
            })
            .collect();
        edges.insert(CONVERSATION_START.to_string(), names);
        Self { edges }
    }

    /// Legal successors of `speaker`, in graph order. `None` means the
    /// graph has no entry for this speaker at all, which callers treat as
    /// a configuration error rather than an empty candidate set.
    pub fn successors(&self, speaker: &str) -> Option<&[String]> {
        self.edges.get(speaker).map(Vec::as_slice)
    }

    /// Every name referenced by the graph (keys and successors) must exist
    /// in the roster; the seed key is exempt. Used to vet rewritten graphs
    /// before they replace the active one.
    pub fn is_consistent_with(&self, roster: &Roster) -> bool {
        self.edges.iter().all(|(from, to)| {
            (from == CONVERSATION_START || roster.contains(from))
                && to.iter().all(|name| roster.contains(name))
        })
    }
}
