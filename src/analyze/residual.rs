//! Residual-add classification
//!
//! A subgraph where a Conv-backboned chain is summed elementwise with
//! another non-constant tensor is a residual add. The non-residual
//! input is the one the backend fuses into the convolution, so its
//! QDQ pair must be removed later.

use std::collections::HashMap;

use tracing::warn;

use crate::graph::pattern::has_const_input;
use crate::graph::traverse::{find_lowest_common_ancestor, get_fusible_backbone, BackboneCache};
use crate::graph::Graph;

/// Maps each `Add` node name to its non-residual input tensor name,
/// or `None` when the add is not a residual join.
///
/// When both inputs have distinct backbones, the input with the longer
/// path to the lowest common ancestor is the non-residual one; equal
/// path lengths select input 0 (fixed policy). An identical backbone
/// on both sides means the add is not residual.
pub fn build_non_residual_input_map(graph: &Graph) -> HashMap<String, Option<String>> {
    let mut non_residual_inputs = HashMap::new();
    let mut cache = BackboneCache::new();

    for (id, node) in graph.node_entries() {
        if node.op != "Add" {
            continue;
        }

        // Adds with a constant or graph-input operand have no
        // residual structure
        let producers: Vec<_> = node
            .inputs
            .iter()
            .take(2)
            .map(|&t| graph.producer(t))
            .collect();
        if has_const_input(graph, id)
            || producers.len() < 2
            || producers.iter().any(Option::is_none)
        {
            non_residual_inputs.insert(node.name.clone(), None);
            continue;
        }

        let input1_producer = producers[0].unwrap();
        let input2_producer = producers[1].unwrap();

        let backbone1 = get_fusible_backbone(graph, input1_producer, &mut cache);
        let backbone2 = get_fusible_backbone(graph, input2_producer, &mut cache);

        let choice = match (backbone1, backbone2) {
            (Some(b1), Some(b2)) if b1 == b2 => None,
            (Some(b1), Some(b2)) => {
                if graph.node(b1).op != graph.node(b2).op {
                    warn!(
                        add = %node.name,
                        "inputs have different backbone types, skipping residual classification"
                    );
                    None
                } else {
                    match find_lowest_common_ancestor(graph, input1_producer, input2_producer) {
                        // Input on the longest path to the LCA is non-residual
                        Some((_, d1, d2)) if d1 >= d2 => Some(node.inputs[0]),
                        Some(_) => Some(node.inputs[1]),
                        None => Some(node.inputs[0]),
                    }
                }
            }
            (Some(_), None) => Some(node.inputs[0]),
            (None, Some(_)) => Some(node.inputs[1]),
            (None, None) => None,
        };

        non_residual_inputs.insert(
            node.name.clone(),
            choice.map(|t| graph.tensor(t).name.clone()),
        );
    }

    non_residual_inputs
}
