//! Property-based tests for trim translation and the tree
//!
//! These verify the rewind arithmetic and fork invariants across all
//! well-paired threads, not just the handful of shapes unit tests cover.

use super::tree::ConversationTree;
use super::trim::{chat_count_for_last_nodes, entries_for_last_nodes, ThreadStats, TrimError};
use super::ThreadEvent;
use proptest::prelude::*;

/// One logical node: a chat message or a matched tool-call pair.
#[derive(Debug, Clone)]
enum LogicalNode {
    Chat { source: String, content: String },
    Pair { call_id: String },
}

fn arb_logical_node() -> impl Strategy<Value = LogicalNode> {
    prop_oneof![
        ("[a-z]{3,8}", "[a-zA-Z ]{1,20}")
            .prop_map(|(source, content)| LogicalNode::Chat { source, content }),
        "[a-z0-9]{6}".prop_map(|call_id| LogicalNode::Pair { call_id }),
    ]
}

fn arb_thread() -> impl Strategy<Value = Vec<ThreadEvent>> {
    proptest::collection::vec(arb_logical_node(), 0..12).prop_map(|nodes| {
        nodes
            .into_iter()
            .enumerate()
            .flat_map(|(i, node)| match node {
                LogicalNode::Chat { source, content } => {
                    vec![ThreadEvent::chat(source, content)]
                }
                LogicalNode::Pair { call_id } => {
                    // Index-suffix keeps call ids unique within a thread.
                    let id = format!("{call_id}-{i}");
                    vec![
                        ThreadEvent::tool_request(id.clone(), "tool", serde_json::json!({})),
                        ThreadEvent::tool_execution(id, "out", false),
                    ]
                }
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Trimming the last n nodes leaves exactly node_count - n nodes.
    #[test]
    fn prop_trim_preserves_node_arithmetic(thread in arb_thread(), n in 0usize..16) {
        let stats = ThreadStats::scan(&thread).unwrap();
        let result = entries_for_last_nodes(&thread, n);

        if n <= stats.node_count {
            let entries = result.unwrap();
            prop_assert!(entries <= thread.len());
            let remaining = &thread[..thread.len() - entries];
            let remaining_stats = ThreadStats::scan(remaining).unwrap();
            prop_assert_eq!(remaining_stats.node_count, stats.node_count - n);
        } else {
            let is_out_of_range = matches!(result, Err(TrimError::OutOfRange { .. }));
            prop_assert!(is_out_of_range);
        }
    }

    /// Chat-only counts never exceed raw entry counts.
    #[test]
    fn prop_chat_count_bounded_by_entries(thread in arb_thread(), n in 0usize..16) {
        let stats = ThreadStats::scan(&thread).unwrap();
        prop_assume!(n <= stats.node_count);

        let entries = entries_for_last_nodes(&thread, n).unwrap();
        let chats = chat_count_for_last_nodes(&thread, n).unwrap();
        prop_assert!(chats <= entries);
        // Each trimmed node is at least one entry, chat nodes exactly one.
        prop_assert!(entries >= n);
        prop_assert!(chats <= n);
    }

    /// Trimming everything accounts for every entry.
    #[test]
    fn prop_full_trim_consumes_all_entries(thread in arb_thread()) {
        let stats = ThreadStats::scan(&thread).unwrap();
        let entries = entries_for_last_nodes(&thread, stats.node_count).unwrap();
        prop_assert_eq!(entries, thread.len());
        let chats = chat_count_for_last_nodes(&thread, stats.node_count).unwrap();
        prop_assert_eq!(chats, stats.chat_nodes);
    }

    /// The tree reproduces the flat log it was built from, one node per
    /// logical unit.
    #[test]
    fn prop_tree_round_trips_flat_log(thread in arb_thread()) {
        let mut tree = ConversationTree::new();
        for event in &thread {
            tree.append(event.clone()).unwrap();
        }
        let stats = ThreadStats::scan(&thread).unwrap();
        prop_assert_eq!(tree.active_depth(), stats.node_count);
        prop_assert_eq!(tree.active_thread(), thread);
    }

    /// Fork retains every node, freezes the abandoned segment, and leaves
    /// exactly one active path.
    #[test]
    fn prop_fork_retains_and_freezes(thread in arb_thread(), rewind in 0usize..16) {
        let mut tree = ConversationTree::new();
        for event in &thread {
            tree.append(event.clone()).unwrap();
        }
        let depth = tree.active_depth();
        prop_assume!(rewind <= depth);

        let count_before = tree.node_ids().len();
        let target = tree.rewind_target(rewind).unwrap();
        tree.fork(&target, "fork").unwrap();
        tree.append(ThreadEvent::chat("forker", "new take")).unwrap();

        // Nothing deleted, one appended.
        prop_assert_eq!(tree.node_ids().len(), count_before + 1);
        prop_assert_eq!(tree.active_depth(), depth - rewind + 1);

        // Single active chain: every active node has at most one active child.
        for id in tree.node_ids() {
            let node = tree.get(&id).unwrap();
            if node.active {
                let active_children = node
                    .children
                    .iter()
                    .filter(|c| tree.get(c).unwrap().active)
                    .count();
                prop_assert!(active_children <= 1);
            }
        }
    }
}
