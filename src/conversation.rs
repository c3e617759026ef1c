//! Conversation history: the flat event log and the branching node tree
//!
//! The run loop emits a flat sequence of [`ThreadEvent`]s. A chat message
//! is one logical node; a tool-call request and its matching execution
//! result form one atomic logical node spanning two log entries. The tree
//! in [`tree`] groups the flat log into addressable nodes, and [`trim`]
//! translates "rewind n nodes" into raw-entry and chat-only counts.

pub mod tree;
pub mod trim;

#[cfg(test)]
mod proptests;

pub use tree::{ConversationTree, Node, NodePayload, TreeError, TreeSnapshot};
pub use trim::{ThreadStats, TrimError};

use serde::{Deserialize, Serialize};

/// One entry in the flat conversation event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadEvent {
    /// A message spoken by a participant (or the supervisor).
    ChatMessage { source: String, content: String },
    /// A participant asked for a tool invocation. Always followed
    /// immediately by the matching [`ThreadEvent::ToolCallExecution`].
    ToolCallRequest {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// The result of the immediately preceding request with the same id.
    ToolCallExecution {
        call_id: String,
        output: String,
        is_error: bool,
    },
}

impl ThreadEvent {
    pub fn chat(source: impl Into<String>, content: impl Into<String>) -> Self {
        ThreadEvent::ChatMessage {
            source: source.into(),
            content: content.into(),
        }
    }

    pub fn tool_request(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        ThreadEvent::ToolCallRequest {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn tool_execution(
        call_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ThreadEvent::ToolCallExecution {
            call_id: call_id.into(),
            output: output.into(),
            is_error,
        }
    }

    /// The speaking participant, for chat entries.
    pub fn source(&self) -> Option<&str> {
        match self {
            ThreadEvent::ChatMessage { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self, ThreadEvent::ChatMessage { .. })
    }
}

/// The speaker of the last chat entry in a thread. Tool entries belong to
/// the turn of the participant whose chat message precedes them, so the
/// walk skips backward over tool entries.
pub fn last_speaker(thread: &[ThreadEvent]) -> Option<&str> {
    thread.iter().rev().find_map(ThreadEvent::source)
}
