//! RTN (Round-to-Nearest) weight quantization
//!
//! Data-free mode: scale factors come straight from each block's max
//! absolute value, `s = amax(block) / 7`. Weights are blocked over the
//! input-channel dimension (axis 0), since graph convention plugs
//! weights into the right-hand side of `y = x @ W`.
//!
//! Unlike the AWQ paths this scans every rank-2 constant input of a
//! Gemm/MatMul, including both-constant matmuls.

use std::collections::HashMap;

use ndarray::{Array2, Ix2};
use tracing::{info, warn};

use crate::graph::qdq::{insert_dq_nodes, insert_qdq_nodes, QdqOpNames};
use crate::graph::{DataType, Graph, TensorData, TensorId};
use crate::quant::block::{find_scales, rtn};
use crate::Result;

/// Rank-2 f32 view of a weight payload, or `None` when blocking
/// cannot apply
pub(crate) fn weight_as_2d(data: &TensorData) -> Option<Array2<f32>> {
    if data.ndim() != 2 {
        return None;
    }
    data.to_f32().into_dimensionality::<Ix2>().ok()
}

/// Quantize all Gemm/MatMul constant inputs with RTN scales.
///
/// With `dq_only`, the weights are pre-quantized and baked behind
/// Dequantize nodes; otherwise full Quantize/Dequantize pairs keep
/// the original weights in place.
pub fn quantize_rtn(
    graph: &mut Graph,
    gemm_io_type: DataType,
    dq_only: bool,
    block_size: usize,
    ops: QdqOpNames,
) -> Result<()> {
    let mut gemm_weights: HashMap<String, Array2<f32>> = HashMap::new();
    let mut act_tensors: Vec<TensorId> = Vec::new();

    for (_, node) in graph.node_entries() {
        if !matches!(node.op.as_str(), "Gemm" | "MatMul") {
            continue;
        }
        for &input in &node.inputs {
            let tensor = graph.tensor(input);
            let data = match tensor.data() {
                Some(d) => d,
                None => continue,
            };
            if data.ndim() == 1 {
                // 1-D blocked quantization not supported
                continue;
            }
            match weight_as_2d(data) {
                Some(w) => {
                    gemm_weights.insert(tensor.name.clone(), w);
                    act_tensors.push(node.inputs[0]);
                }
                None => {
                    warn!(tensor = %tensor.name, "skipping non-rank-2 weight");
                }
            }
        }
    }

    if gemm_weights.is_empty() {
        info!("no quantizable weights found, leaving graph unmodified");
        return Ok(());
    }

    let mut scales: HashMap<String, TensorData> = HashMap::new();
    let mut scales_f32: HashMap<String, Array2<f32>> = HashMap::new();
    for (name, w) in &gemm_weights {
        let s = find_scales(w, block_size, 1.0);
        scales.insert(
            name.clone(),
            TensorData::from_f32(s.clone().into_dyn(), gemm_io_type)?,
        );
        scales_f32.insert(name.clone(), s);
    }
    info!(count = scales.len(), "computed RTN scales");

    // Activation inputs take the expected compute type
    let act_names: Vec<String> = act_tensors
        .iter()
        .map(|&t| graph.tensor(t).name.clone())
        .collect();
    for name in act_names {
        graph.set_tensor_dtype(&name, gemm_io_type)?;
    }

    if dq_only {
        let mut quantized: HashMap<String, Array2<i8>> = HashMap::new();
        for (name, w) in &gemm_weights {
            quantized.insert(name.clone(), rtn(w, &scales_f32[name], block_size));
        }
        insert_dq_nodes(graph, &scales, &quantized, block_size, ops)?;
    } else {
        insert_qdq_nodes(graph, &scales, block_size, ops)?;
    }

    Ok(())
}
