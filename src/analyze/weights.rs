//! Quantizable-weight discovery

use crate::graph::{DataType, Graph, NodeId, TensorId};

/// Nodes whose name contains one of these substrings are never
/// quantized (the language-model output head dominates accuracy)
pub const EXCLUDE_NODE_SUBSTRINGS: &[&str] = &["lm_head"];

/// One quantizable weight: the consuming node, its activation input,
/// the weight initializer, whether the weight is stored transposed
/// (`Gemm` with `transB`), and the element type to restore on output.
#[derive(Clone, Debug)]
pub struct WeightPack {
    pub node: NodeId,
    pub act_tensor: TensorId,
    pub weight_tensor: TensorId,
    pub do_transpose: bool,
    pub io_dtype: DataType,
}

/// Scan for `Gemm`/`MatMul` nodes with a constant second input that
/// block quantization can handle.
///
/// Excluded: deny-listed node names, nodes whose first input is itself
/// constant (both-constant matmuls belong to a separate folding path),
/// and rank-1 weights (blocking needs at least 2 dims).
pub fn find_quantizable_weights(graph: &Graph) -> Vec<WeightPack> {
    let mut packs = Vec::new();
    for (id, node) in graph.node_entries() {
        if !matches!(node.op.as_str(), "Gemm" | "MatMul") {
            continue;
        }
        if EXCLUDE_NODE_SUBSTRINGS
            .iter()
            .any(|pat| node.name.contains(pat))
        {
            continue;
        }
        let (&act, &weight) = match (node.inputs.first(), node.inputs.get(1)) {
            (Some(a), Some(w)) => (a, w),
            _ => continue,
        };
        if graph.tensor(act).is_constant() {
            // Both-constant matmul, left to constant folding
            continue;
        }
        let weight_data = match graph.tensor(weight).data() {
            Some(d) => d,
            None => continue,
        };
        if weight_data.ndim() == 1 {
            // 1-D blocked quantization not supported
            continue;
        }

        let do_transpose = node.op == "Gemm" && node.attr_int("transB").unwrap_or(0) > 0;

        packs.push(WeightPack {
            node: id,
            act_tensor: act,
            weight_tensor: weight,
            do_transpose,
            io_dtype: weight_data.dtype(),
        });
    }
    packs
}
