//! Recursive graph pattern matching
//!
//! `has_path_type` walks forward (toward consumers) or backward
//! (toward producers) from a start node, matching an ordered list of
//! operator-type tokens. Two synthesized tokens are derived from a
//! node's operator plus a constant-input check rather than being
//! literal operator names:
//!
//! - `BiasAdd`: an `Add` with a constant input
//! - `ConstMul`: a `Mul` with a constant input
//!
//! Both are optional: when the current node does not match one of
//! them at the head of the pattern, the token is skipped without
//! consuming a node. Wildcard types are traversed transparently and
//! never appear in the matched path.

use super::{Graph, NodeId, TensorId};

/// Traversal direction for path matching
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Walk toward consumers
    Forward,
    /// Walk toward producers
    Backward,
}

const OPTIONAL_PATH_TYPES: [&str; 2] = ["BiasAdd", "ConstMul"];

/// Whether the tensor is a constant or produced by const-foldable nodes
pub fn is_const_input(graph: &Graph, tensor: TensorId) -> bool {
    if graph.tensor(tensor).is_constant() {
        return true;
    }

    let producer = match graph.producer(tensor) {
        Some(p) => p,
        // Tensor is a graph input variable
        None => return false,
    };

    let producer_node = graph.node(producer);
    if matches!(producer_node.op.as_str(), "Constant" | "Identity") {
        return true;
    }

    // Second axes input to Squeeze/Unsqueeze is a constant, so the
    // first input decides
    if matches!(producer_node.op.as_str(), "Squeeze" | "Unsqueeze") {
        if let Some(&first) = producer_node.inputs.first() {
            if is_const_input(graph, first) {
                return true;
            }
        }
    }

    // Const -> Clip -> Exp chain (swin_v2 relative position bias)
    if producer_node.op == "Exp" {
        if let Some(&exp_in) = producer_node.inputs.first() {
            if let Some(clip) = graph.producer(exp_in) {
                if graph.node(clip).op == "Clip" && has_const_input(graph, clip) {
                    return true;
                }
            }
        }
    }

    false
}

/// Whether the node has any constant input
pub fn has_const_input(graph: &Graph, node: NodeId) -> bool {
    graph
        .node(node)
        .inputs
        .iter()
        .any(|&t| is_const_input(graph, t))
}

/// Operator type of a node with the `BiasAdd`/`ConstMul` synthesis applied
pub fn synthesized_op(graph: &Graph, node: NodeId) -> &'static str {
    match graph.node(node).op.as_str() {
        "Add" if has_const_input(graph, node) => "BiasAdd",
        "Mul" if has_const_input(graph, node) => "ConstMul",
        _ => "",
    }
}

/// Checks whether `node` starts (forward) or ends (backward) a path of
/// the given type sequence, appending matched nodes to `path_nodes` in
/// traversal order.
///
/// Matching is depth-first with early exit: the first child (or
/// parent) branch that satisfies the remaining pattern wins. On
/// failure the accumulator is not rolled back; callers must use a
/// fresh accumulator per attempt.
pub fn has_path_type(
    graph: &Graph,
    node: NodeId,
    path_type: &[&str],
    direction: Direction,
    wild_card_types: &[&str],
    path_nodes: &mut Vec<NodeId>,
) -> bool {
    let head = match path_type.first() {
        Some(&h) => h,
        // All types matched
        None => return true,
    };

    let op = graph.node(node).op.as_str();
    let synth = synthesized_op(graph, node);
    let node_type = if synth.is_empty() { op } else { synth };

    let is_match = node_type == head || op == head;
    let is_wild_match = wild_card_types.contains(&node_type);
    let head_is_optional = OPTIONAL_PATH_TYPES.contains(&head);

    if !is_match && !is_wild_match && !head_is_optional {
        return false;
    }

    if is_match {
        path_nodes.push(node);
    }

    // Non-repeatable optional types are consumed even when unmatched
    let next_path_type: &[&str] = if is_match || head_is_optional {
        &path_type[1..]
    } else {
        path_type
    };

    // Optional head skipped: retry the same node against the rest
    if !is_match && !is_wild_match {
        debug_assert!(head_is_optional);
        return has_path_type(
            graph,
            node,
            next_path_type,
            direction,
            wild_card_types,
            path_nodes,
        );
    }

    let next_level = match direction {
        Direction::Forward => graph.children(node),
        Direction::Backward => graph.parents(node),
    };

    for next in next_level {
        let mut sub_path = Vec::new();
        if has_path_type(
            graph,
            next,
            next_path_type,
            direction,
            wild_card_types,
            &mut sub_path,
        ) {
            path_nodes.extend(sub_path);
            return true;
        }
    }

    // Nothing left to match means the path is complete
    next_path_type.is_empty()
}
