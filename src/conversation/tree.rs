//! Branching node tree over the flat event log
//!
//! Chat messages become nodes immediately; a tool-call request is buffered
//! until its execution result arrives, then the pair lands as one node.
//! Rewinding forks the tree: nodes below the fork point are deactivated
//! but retained forever, so every past branch stays auditable.

use super::ThreadEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("unknown node id: {0}")]
    UnknownNode(String),

    #[error("node {0} is not on the active branch")]
    NotOnActivePath(String),

    #[error("execution of call {execution_id} does not match pending request {pending}")]
    UnmatchedExecution {
        execution_id: String,
        pending: String,
    },

    #[error("tool-call request {new_call} arrived while request {pending} was still open")]
    OverlappingRequest { new_call: String, pending: String },

    #[error("cannot rewind {requested} nodes, active branch only has {depth}")]
    RewindTooDeep { requested: usize, depth: usize },
}

/// What one tree node holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodePayload {
    /// Synthetic anchor above the first real node. Every branch descends
    /// from it, so a full rewind is an ordinary fork at the root.
    Root,
    Chat {
        source: String,
        content: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
        output: String,
        is_error: bool,
    },
}

/// One addressable unit of conversation history. Content is frozen at
/// creation; only the `children` list and `active` flag ever change.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub branch_id: String,
    pub active: bool,
    pub payload: NodePayload,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Expand the node back into its flat log entries.
    pub fn events(&self) -> Vec<ThreadEvent> {
        match &self.payload {
            NodePayload::Root => vec![],
            NodePayload::Chat { source, content } => {
                vec![ThreadEvent::chat(source.clone(), content.clone())]
            }
            NodePayload::ToolCall {
                call_id,
                tool_name,
                arguments,
                output,
                is_error,
            } => vec![
                ThreadEvent::tool_request(call_id.clone(), tool_name.clone(), arguments.clone()),
                ThreadEvent::tool_execution(call_id.clone(), output.clone(), *is_error),
            ],
        }
    }
}

/// Serializable view of the tree for viewer broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct TreeSnapshot {
    pub root: SnapshotNode,
    pub current_branch_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotNode {
    pub id: String,
    pub branch_id: String,
    pub active: bool,
    #[serde(flatten)]
    pub payload: NodePayload,
    pub children: Vec<SnapshotNode>,
}

const ROOT_ID: &str = "root";
const INITIAL_BRANCH: &str = "main";

/// The branching conversation tree for one session.
#[derive(Debug)]
pub struct ConversationTree {
    nodes: HashMap<String, Node>,
    frontier: String,
    current_branch: String,
    /// Request half of an in-flight tool-call pair.
    pending_request: Option<PendingRequest>,
}

#[derive(Debug)]
struct PendingRequest {
    call_id: String,
    tool_name: String,
    arguments: serde_json::Value,
}

impl Default for ConversationTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationTree {
    pub fn new() -> Self {
        let root = Node {
            id: ROOT_ID.to_string(),
            parent: None,
            children: Vec::new(),
            branch_id: INITIAL_BRANCH.to_string(),
            active: true,
            payload: NodePayload::Root,
            created_at: Utc::now(),
        };
        let mut nodes = HashMap::new();
        nodes.insert(root.id.clone(), root);
        Self {
            nodes,
            frontier: ROOT_ID.to_string(),
            current_branch: INITIAL_BRANCH.to_string(),
            pending_request: None,
        }
    }

    #[allow(dead_code)] // Query API, exercised by tests
    pub fn root_id(&self) -> &str {
        ROOT_ID
    }

    #[allow(dead_code)] // Query API, exercised by tests
    pub fn frontier_id(&self) -> &str {
        &self.frontier
    }

    #[allow(dead_code)] // Query API, exercised by tests
    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    #[allow(dead_code)] // Query API, exercised by tests
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Append one flat-log event. Chat messages produce a node right away;
    /// a tool-call request is held until its execution arrives, at which
    /// point the pair is returned as a single node.
    pub fn append(&mut self, event: ThreadEvent) -> Result<Option<Node>, TreeError> {
        match event {
            ThreadEvent::ChatMessage { source, content } => {
                let node = self.attach(NodePayload::Chat { source, content });
                Ok(Some(node))
            }
            ThreadEvent::ToolCallRequest {
                call_id,
                tool_name,
                arguments,
            } => {
                if let Some(pending) = &self.pending_request {
                    return Err(TreeError::OverlappingRequest {
                        new_call: call_id,
                        pending: pending.call_id.clone(),
                    });
                }
                self.pending_request = Some(PendingRequest {
                    call_id,
                    tool_name,
                    arguments,
                });
                Ok(None)
            }
            ThreadEvent::ToolCallExecution {
                call_id,
                output,
                is_error,
            } => {
                let pending = match self.pending_request.take() {
                    Some(p) if p.call_id == call_id => p,
                    Some(p) => {
                        let pending_id = p.call_id.clone();
                        // Restore the buffer; this execution is rejected,
                        // the open request is still awaiting its result.
                        self.pending_request = Some(p);
                        return Err(TreeError::UnmatchedExecution {
                            execution_id: call_id,
                            pending: pending_id,
                        });
                    }
                    None => {
                        return Err(TreeError::UnmatchedExecution {
                            execution_id: call_id,
                            pending: "<none>".to_string(),
                        })
                    }
                };
                let node = self.attach(NodePayload::ToolCall {
                    call_id: pending.call_id,
                    tool_name: pending.tool_name,
                    arguments: pending.arguments,
                    output,
                    is_error,
                });
                Ok(Some(node))
            }
        }
    }

    fn attach(&mut self, payload: NodePayload) -> Node {
        let node = Node {
            id: uuid::Uuid::new_v4().to_string(),
            parent: Some(self.frontier.clone()),
            children: Vec::new(),
            branch_id: self.current_branch.clone(),
            active: true,
            payload,
            created_at: Utc::now(),
        };
        if let Some(parent) = self.nodes.get_mut(&self.frontier) {
            parent.children.push(node.id.clone());
        }
        self.frontier = node.id.clone();
        self.nodes.insert(node.id.clone(), node.clone());
        node
    }

    /// The node id `n` logical nodes above the frontier on the active
    /// branch; the root for a full rewind.
    pub fn rewind_target(&self, n: usize) -> Result<String, TreeError> {
        let depth = self.active_depth();
        if n > depth {
            return Err(TreeError::RewindTooDeep {
                requested: n,
                depth,
            });
        }
        let mut id = self.frontier.clone();
        for _ in 0..n {
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
            id = node
                .parent
                .clone()
                .ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
        }
        Ok(id)
    }

    /// Logical node count on the active path (root excluded).
    pub fn active_depth(&self) -> usize {
        let mut depth = 0;
        let mut id = self.frontier.as_str();
        while let Some(node) = self.nodes.get(id) {
            match &node.parent {
                Some(parent) => {
                    depth += 1;
                    id = parent;
                }
                None => break,
            }
        }
        depth
    }

    /// Fork at `ancestor_id`: every node strictly below the ancestor on
    /// the active path is deactivated (retained, frozen), the frontier
    /// moves to the ancestor, and subsequent appends open `new_branch_id`.
    pub fn fork(&mut self, ancestor_id: &str, new_branch_id: &str) -> Result<String, TreeError> {
        if !self.nodes.contains_key(ancestor_id) {
            return Err(TreeError::UnknownNode(ancestor_id.to_string()));
        }

        // Collect the frontier->ancestor segment first so a bad ancestor
        // leaves the tree untouched.
        let mut to_deactivate = Vec::new();
        let mut id = self.frontier.clone();
        while id != ancestor_id {
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
            to_deactivate.push(id.clone());
            match &node.parent {
                Some(parent) => id = parent.clone(),
                None => return Err(TreeError::NotOnActivePath(ancestor_id.to_string())),
            }
        }

        for id in to_deactivate {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.active = false;
            }
        }
        // A request buffered mid-pair belongs to the abandoned branch.
        self.pending_request = None;
        self.frontier = ancestor_id.to_string();
        self.current_branch = new_branch_id.to_string();
        Ok(self.frontier.clone())
    }

    /// Flat event log of the active path, root to frontier.
    #[allow(dead_code)] // Query API, exercised by tests
    pub fn active_thread(&self) -> Vec<ThreadEvent> {
        let mut path = Vec::new();
        let mut id = self.frontier.as_str();
        while let Some(node) = self.nodes.get(id) {
            path.push(node);
            match &node.parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
        path.into_iter()
            .rev()
            .flat_map(Node::events)
            .collect()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.snapshot_node(ROOT_ID),
            current_branch_id: self.current_branch.clone(),
        }
    }

    fn snapshot_node(&self, id: &str) -> SnapshotNode {
        let node = &self.nodes[id];
        SnapshotNode {
            id: node.id.clone(),
            branch_id: node.branch_id.clone(),
            active: node.active,
            payload: node.payload.clone(),
            children: node
                .children
                .iter()
                .map(|child| self.snapshot_node(child))
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}
