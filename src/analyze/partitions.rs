//! Partition classification for partial quantization
//!
//! Compiler partitions come in two flavors: CASK-fusible partitions
//! rooted at a linear op, and KGEN (pointwise codegen) partitions.
//! Nodes whose inputs all stay inside their partition need no
//! quantization; nodes with a mix of internal and external inputs are
//! partially quantizable, and their internal edges are collected as
//! no-quantize inputs for later QDQ removal.

use std::collections::HashSet;

use crate::graph::pattern::{has_const_input, is_const_input};
use crate::graph::{Graph, NodeId};
use crate::ops::{is_copy_op, is_linear_op};
use crate::{Error, Result};

/// An edge that must bypass quantization, addressed by names so the
/// entry survives graph mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoQuantizeInput {
    pub producer: String,
    pub consumer: String,
    pub tensor: String,
}

/// Split partition nodes into non-quantizable, quantizable, and
/// partially-quantizable (their internal input edges are returned as
/// no-quantize inputs).
pub fn classify_partition_nodes(
    graph: &Graph,
    partitions: &[Vec<NodeId>],
) -> Result<(Vec<NodeId>, Vec<NodeId>, Vec<NoQuantizeInput>)> {
    let mut non_quantizable = Vec::new();
    let mut quantizable = Vec::new();
    let mut no_quantize_inputs = Vec::new();

    for partition in partitions {
        let root = partition
            .first()
            .ok_or_else(|| Error::Graph("empty partition".to_string()))?;
        if !is_linear_op(&graph.node(*root).op) {
            return Err(Error::Graph(format!(
                "partition root '{}' is not a linear op",
                graph.node(*root).name
            )));
        }

        let partition_outputs: HashSet<&str> = partition
            .iter()
            .flat_map(|&n| graph.node(n).outputs.iter())
            .map(|&t| graph.tensor(t).name.as_str())
            .collect();

        for &node_id in partition {
            let node = graph.node(node_id);
            let mut has_external_inputs = false;
            let mut internal_inputs = Vec::new();
            for &tensor in &node.inputs {
                if is_const_input(graph, tensor) {
                    continue;
                }
                let tensor_name = graph.tensor(tensor).name.as_str();
                if !partition_outputs.contains(tensor_name) {
                    // Partition heads with outside inputs are fully
                    // quantizable and handled below
                    has_external_inputs = true;
                } else if let Some(producer) = graph.producer(tensor) {
                    // The producer may itself end up unquantized;
                    // post-processing just skips such entries
                    internal_inputs.push(NoQuantizeInput {
                        producer: graph.node(producer).name.clone(),
                        consumer: node.name.clone(),
                        tensor: tensor_name.to_string(),
                    });
                }
            }

            if !has_external_inputs {
                non_quantizable.push(node_id);
            } else if !internal_inputs.is_empty() {
                no_quantize_inputs.extend(internal_inputs);
            } else {
                quantizable.push(node_id);
            }
        }
    }

    Ok((non_quantizable, quantizable, no_quantize_inputs))
}

/// KGEN partition heads that consume a CASK partition's output (or a
/// pooling/normalization output) are quantizable; inputs of such an
/// `Add` head with no other quantizable consumer are collected as
/// no-quantize inputs.
pub fn filter_quantizable_kgen_heads(
    graph: &Graph,
    cask_partitions: &[Vec<NodeId>],
    kgen_partitions: &[Vec<NodeId>],
    quantizable_op_types: &[String],
) -> (Vec<NodeId>, Vec<NoQuantizeInput>) {
    let cask_partition_nodes: HashSet<&str> = cask_partitions
        .iter()
        .flat_map(|p| p.iter())
        .map(|&n| graph.node(n).name.as_str())
        .collect();
    let cask_partition_heads: Vec<NodeId> = cask_partitions
        .iter()
        .filter_map(|p| p.first().copied())
        .collect();

    fn follows_cask(graph: &Graph, node: NodeId, cask_nodes: &HashSet<&str>) -> bool {
        if cask_nodes.contains(graph.node(node).name.as_str()) {
            return true;
        }
        if !is_copy_op(&graph.node(node).op) {
            return false;
        }
        graph
            .parents(node)
            .into_iter()
            .any(|p| follows_cask(graph, p, cask_nodes))
    }

    let output_quantization_candidates = [
        "AveragePool",
        "BatchNormalization",
        "GlobalAveragePool",
        "MaxPool",
    ];

    let mut quantizable_heads: Vec<NodeId> = Vec::new();
    let mut no_quantize_inputs = Vec::new();

    for partition in kgen_partitions {
        let head = match partition.first() {
            Some(&h) => h,
            None => continue,
        };
        let head_node = graph.node(head);
        if !quantizable_op_types.contains(&head_node.op) {
            continue;
        }
        if has_const_input(graph, head) {
            continue;
        }

        let mut no_quantize_of_head = Vec::new();
        let mut has_quantizable_input = false;

        for parent in graph.parents(head) {
            let parent_node = graph.node(parent);
            if follows_cask(graph, parent, &cask_partition_nodes)
                || output_quantization_candidates.contains(&parent_node.op.as_str())
            {
                quantizable_heads.push(head);
                has_quantizable_input = true;
                continue;
            }

            // Approximate check: later kgen heads may not be
            // discovered yet
            let parent_output = match parent_node.outputs.first() {
                Some(&t) => t,
                None => continue,
            };
            let known_quantizable: HashSet<&str> = cask_partition_heads
                .iter()
                .chain(quantizable_heads.iter())
                .map(|&n| graph.node(n).name.as_str())
                .filter(|&name| name != head_node.name)
                .collect();
            let has_other_consumer = graph
                .consumers(parent_output)
                .iter()
                .any(|&c| known_quantizable.contains(graph.node(c).name.as_str()));
            if !has_other_consumer {
                no_quantize_of_head.push(NoQuantizeInput {
                    producer: parent_node.name.clone(),
                    consumer: head_node.name.clone(),
                    tensor: graph.tensor(parent_output).name.clone(),
                });
            }
        }

        if head_node.op == "Add" && has_quantizable_input {
            no_quantize_inputs.extend(no_quantize_of_head);
        }
    }

    (quantizable_heads, no_quantize_inputs)
}
