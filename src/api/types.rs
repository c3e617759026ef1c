//! API request and response types

use serde::{Deserialize, Serialize};

/// Messages a viewer connection may send over the WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Supervisor contribution redirected at a participant, optionally
    /// rewinding `trim_count` logical nodes first.
    UserDirectedMessage {
        content: String,
        target_agent: String,
        #[serde(default)]
        trim_count: usize,
    },
    /// Cancel the turn currently in flight.
    UserInterrupt {},
    /// Answer to a pending input request.
    AgentInputResponse {
        request_id: String,
        user_input: String,
    },
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<String>,
}
