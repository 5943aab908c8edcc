//! Ancestor traversal helpers
//!
//! Backbone lookup for fusible linear chains and lowest-common-ancestor
//! search, both memoized by node identity so diamond-shaped graphs stay
//! linear instead of exponential.

use std::collections::{HashMap, VecDeque};

use super::pattern::{has_path_type, Direction};
use super::{Graph, NodeId};

/// Path shapes the backend fuses onto a Conv backbone.
/// BiasAdd and ConstMul tokens are optional within each shape.
const FUSIBLE_LINEAR_PATH_TYPES: [&[&str]; 4] = [
    &["BiasAdd", "ConstMul", "Conv"],
    &["Relu", "BiasAdd", "ConstMul", "Conv"],
    &["BatchNormalization", "BiasAdd", "Conv"],
    &["Relu", "BatchNormalization", "BiasAdd", "Conv"],
];

/// Per-pass memo for backbone lookups
pub type BackboneCache = HashMap<NodeId, Option<NodeId>>;

/// Returns the linear backbone (`Conv`) node behind `node` if the node
/// sits at the end of a fusible chain, `None` otherwise.
pub fn get_fusible_backbone(
    graph: &Graph,
    node: NodeId,
    cache: &mut BackboneCache,
) -> Option<NodeId> {
    if let Some(&hit) = cache.get(&node) {
        return hit;
    }

    let mut result = None;
    for path_type in FUSIBLE_LINEAR_PATH_TYPES {
        let mut path = Vec::new();
        if has_path_type(graph, node, path_type, Direction::Backward, &[], &mut path) {
            result = find_backbone(graph, node, cache);
            break;
        }
    }

    cache.insert(node, result);
    result
}

/// Depth-first walk through non-constant inputs until a Conv is found
fn find_backbone(graph: &Graph, root: NodeId, cache: &mut BackboneCache) -> Option<NodeId> {
    if graph.node(root).op == "Conv" {
        return Some(root);
    }

    for &tensor in &graph.node(root).inputs {
        if graph.tensor(tensor).is_constant() {
            continue;
        }
        if let Some(parent) = graph.producer(tensor) {
            if let Some(&hit) = cache.get(&parent) {
                if let Some(bb) = hit {
                    return Some(bb);
                }
                continue;
            }
            let bb = find_backbone(graph, parent, cache);
            cache.insert(parent, bb);
            if bb.is_some() {
                return bb;
            }
        }
    }

    None
}

/// Minimum edge distance from `node` to each of its ancestors (and to
/// itself, at depth 0), by breadth-first search.
pub fn ancestor_depths(graph: &Graph, node: NodeId) -> HashMap<NodeId, usize> {
    let mut depths = HashMap::new();
    let mut queue = VecDeque::new();
    depths.insert(node, 0usize);
    queue.push_back(node);
    while let Some(current) = queue.pop_front() {
        let next_depth = depths[&current] + 1;
        for parent in graph.parents(current) {
            if !depths.contains_key(&parent) {
                depths.insert(parent, next_depth);
                queue.push_back(parent);
            }
        }
    }
    depths
}

/// Lowest common ancestor of two nodes.
///
/// Returns `(ancestor, d1, d2)` where `d1`/`d2` are the distances from
/// `node1`/`node2` to the ancestor; the ancestor minimizing `d1 + d2`
/// wins. Returns `None` when the nodes share no ancestor.
pub fn find_lowest_common_ancestor(
    graph: &Graph,
    node1: NodeId,
    node2: NodeId,
) -> Option<(NodeId, usize, usize)> {
    let depths1 = ancestor_depths(graph, node1);
    let depths2 = ancestor_depths(graph, node2);

    let mut best: Option<(NodeId, usize, usize)> = None;
    for (&candidate, &d1) in &depths1 {
        if let Some(&d2) = depths2.get(&candidate) {
            let better = match best {
                Some((_, b1, b2)) => d1 + d2 < b1 + b2,
                None => true,
            };
            if better {
                best = Some((candidate, d1, d2));
            }
        }
    }
    best
}
