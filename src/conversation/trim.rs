//! Rewind-count translation over the flat event log
//!
//! A supervisor rewind is expressed in logical nodes, but three consumers
//! count differently: the raw log counts every entry, a tool-call pair is
//! one node spanning two entries, and participant-local chat buffers hold
//! no tool entries at all. Both conversions here walk the log backward
//! from the tail, treating each (request, execution) pair as one unit, and
//! refuse to guess when the pairing is broken.

use super::ThreadEvent;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrimError {
    /// A tool-call execution was not immediately preceded by its matching
    /// request. The log is corrupt at that point; the rewind is refused
    /// rather than guessed at.
    #[error("unmatched tool-call pair at entry {index}: {detail}")]
    CorruptPair { index: usize, detail: String },

    /// The rewind asks for more logical nodes than the thread contains.
    #[error("cannot rewind {requested} nodes, thread only has {available}")]
    OutOfRange { requested: usize, available: usize },
}

/// Raw log entries spanned by the last `n` logical nodes.
///
/// `n == 0` is a no-op returning 0 without touching the slice.
pub fn entries_for_last_nodes(thread: &[ThreadEvent], n: usize) -> Result<usize, TrimError> {
    walk_last_nodes(thread, n).map(|walk| walk.entries)
}

/// Chat-message count among the last `n` logical nodes. Tool-call pairs
/// consume node budget but contribute zero, so the result fits buffers
/// that hold no tool entries.
pub fn chat_count_for_last_nodes(thread: &[ThreadEvent], n: usize) -> Result<usize, TrimError> {
    walk_last_nodes(thread, n).map(|walk| walk.chat_messages)
}

struct Walk {
    entries: usize,
    chat_messages: usize,
}

fn walk_last_nodes(thread: &[ThreadEvent], n: usize) -> Result<Walk, TrimError> {
    let mut walk = Walk {
        entries: 0,
        chat_messages: 0,
    };
    if n == 0 {
        return Ok(walk);
    }

    let mut index = thread.len();
    let mut nodes = 0;

    while nodes < n {
        if index == 0 {
            return Err(TrimError::OutOfRange {
                requested: n,
                available: nodes,
            });
        }
        index -= 1;

        match &thread[index] {
            ThreadEvent::ChatMessage { .. } => {
                walk.entries += 1;
                walk.chat_messages += 1;
            }
            ThreadEvent::ToolCallExecution { call_id, .. } => {
                let request = index.checked_sub(1).map(|i| &thread[i]);
                match request {
                    Some(ThreadEvent::ToolCallRequest {
                        call_id: request_id,
                        ..
                    }) if request_id == call_id => {
                        index -= 1;
                        walk.entries += 2;
                    }
                    _ => {
                        return Err(TrimError::CorruptPair {
                            index,
                            detail: format!("execution of call {call_id} has no matching request"),
                        })
                    }
                }
            }
            ThreadEvent::ToolCallRequest { call_id, .. } => {
                // Walking backward, a request is always consumed together
                // with its execution; reaching one directly means the
                // execution never arrived.
                return Err(TrimError::CorruptPair {
                    index,
                    detail: format!("request {call_id} has no execution result"),
                });
            }
        }
        nodes += 1;
    }

    Ok(walk)
}

/// Diagnostic totals for a thread. Inspection and tests only; control flow
/// never depends on it.
#[allow(dead_code)] // Inspection surface, exercised by tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStats {
    pub total_entries: usize,
    pub node_count: usize,
    pub chat_nodes: usize,
    pub tool_pair_nodes: usize,
}

impl ThreadStats {
    #[allow(dead_code)] // Inspection surface, exercised by tests
    pub fn scan(thread: &[ThreadEvent]) -> Result<Self, TrimError> {
        let mut stats = ThreadStats {
            total_entries: thread.len(),
            node_count: 0,
            chat_nodes: 0,
            tool_pair_nodes: 0,
        };

        let mut index = 0;
        while index < thread.len() {
            match &thread[index] {
                ThreadEvent::ChatMessage { .. } => {
                    stats.chat_nodes += 1;
                    index += 1;
                }
                ThreadEvent::ToolCallRequest { call_id, .. } => {
                    match thread.get(index + 1) {
                        Some(ThreadEvent::ToolCallExecution {
                            call_id: execution_id,
                            ..
                        }) if execution_id == call_id => {
                            stats.tool_pair_nodes += 1;
                            index += 2;
                        }
                        _ => {
                            return Err(TrimError::CorruptPair {
                                index,
                                detail: format!("request {call_id} has no execution result"),
                            })
                        }
                    }
                }
                ThreadEvent::ToolCallExecution { call_id, .. } => {
                    return Err(TrimError::CorruptPair {
                        index,
                        detail: format!("execution of call {call_id} has no matching request"),
                    });
                }
            }
            stats.node_count += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paired_thread() -> Vec<ThreadEvent> {
        vec![
            ThreadEvent::chat("alice", "look this up"),
            ThreadEvent::tool_request("c1", "search", json!({"q": "rust"})),
            ThreadEvent::tool_execution("c1", "found it", false),
            ThreadEvent::chat("bob", "thanks"),
        ]
    }

    #[test]
    fn test_pair_and_message_span_three_entries() {
        let thread = paired_thread();
        // Last 2 nodes: the tool pair + bob's message.
        assert_eq!(entries_for_last_nodes(&thread, 2), Ok(3));
        assert_eq!(chat_count_for_last_nodes(&thread, 2), Ok(1));
    }

    #[test]
    fn test_zero_is_noop() {
        assert_eq!(entries_for_last_nodes(&paired_thread(), 0), Ok(0));
        assert_eq!(chat_count_for_last_nodes(&paired_thread(), 0), Ok(0));
        // Even on a corrupt thread: zero never walks.
        let corrupt = vec![ThreadEvent::tool_execution("c9", "", true)];
        assert_eq!(entries_for_last_nodes(&corrupt, 0), Ok(0));
    }

    #[test]
    fn test_full_rewind() {
        let thread = paired_thread();
        assert_eq!(entries_for_last_nodes(&thread, 3), Ok(4));
        assert_eq!(chat_count_for_last_nodes(&thread, 3), Ok(2));
    }

    #[test]
    fn test_too_deep_is_out_of_range() {
        let thread = paired_thread();
        assert_eq!(
            entries_for_last_nodes(&thread, 4),
            Err(TrimError::OutOfRange {
                requested: 4,
                available: 3,
            })
        );
    }

    #[test]
    fn test_execution_without_request_is_corrupt() {
        let thread = vec![
            ThreadEvent::chat("alice", "hm"),
            ThreadEvent::tool_execution("c1", "out", false),
        ];
        assert!(matches!(
            entries_for_last_nodes(&thread, 1),
            Err(TrimError::CorruptPair { index: 1, .. })
        ));
    }

    #[test]
    fn test_mismatched_call_id_is_corrupt() {
        let thread = vec![
            ThreadEvent::tool_request("c1", "search", json!({})),
            ThreadEvent::tool_execution("c2", "out", false),
        ];
        assert!(matches!(
            entries_for_last_nodes(&thread, 1),
            Err(TrimError::CorruptPair { .. })
        ));
    }

    #[test]
    fn test_dangling_request_is_corrupt() {
        let thread = vec![
            ThreadEvent::chat("alice", "hm"),
            ThreadEvent::tool_request("c1", "search", json!({})),
        ];
        assert!(matches!(
            entries_for_last_nodes(&thread, 1),
            Err(TrimError::CorruptPair { index: 1, .. })
        ));
    }

    #[test]
    fn test_stats_breakdown() {
        let stats = ThreadStats::scan(&paired_thread()).unwrap();
        assert_eq!(
            stats,
            ThreadStats {
                total_entries: 4,
                node_count: 3,
                chat_nodes: 2,
                tool_pair_nodes: 1,
            }
        );
    }

    #[test]
    fn test_stats_empty_thread() {
        let stats = ThreadStats::scan(&[]).unwrap();
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.total_entries, 0);
    }
}
