//! QDQ graph surgery
//!
//! Inserts Quantize/Dequantize and Cast nodes, rewires
//! producer/consumer edges around them, and removes QDQ pairs from
//! edges marked non-quantizable. Every entry point finishes with
//! `cleanup()` + `toposort()` so the graph leaves in exportable shape.
//!
//! Entries are addressed by tensor/node name: the analysis passes run
//! on the pre-mutation graph, and stale references are skipped with a
//! log line rather than failing the pipeline.

use std::collections::{BTreeMap, HashMap};

use ndarray::Array2;
use tracing::{debug, info, warn};

use super::{AttrValue, Graph, NodeId, TensorData};
use crate::analyze::NoQuantizeInput;
use crate::Result;

/// Operator names used for inserted quantize/dequantize nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QdqOpNames {
    pub quantize: &'static str,
    pub dequantize: &'static str,
}

impl QdqOpNames {
    /// Standard ONNX opset names
    pub fn onnx() -> Self {
        Self {
            quantize: "QuantizeLinear",
            dequantize: "DequantizeLinear",
        }
    }

    /// TensorRT custom-op names for INT4
    pub fn trt() -> Self {
        Self {
            quantize: "TRT_INT4QuantizeLinear",
            dequantize: "TRT_INT4DequantizeLinear",
        }
    }
}

impl Default for QdqOpNames {
    fn default() -> Self {
        Self::onnx()
    }
}

fn dq_attrs(block_size: usize) -> BTreeMap<String, AttrValue> {
    let mut attrs = BTreeMap::new();
    attrs.insert("axis".to_string(), AttrValue::Int(0));
    attrs.insert("block_size".to_string(), AttrValue::Int(block_size as i64));
    attrs
}

/// Replace each listed weight initializer with a Dequantize node fed
/// by its pre-quantized constant and block scales. The original
/// tensor keeps its name and becomes the Dequantize output, so
/// consumers stay wired.
pub fn insert_dq_nodes(
    graph: &mut Graph,
    scales: &HashMap<String, TensorData>,
    quantized_weights: &HashMap<String, Array2<i8>>,
    block_size: usize,
    ops: QdqOpNames,
) -> Result<()> {
    let mut inserted = 0usize;
    for (name, scale) in scales {
        let weight = match graph.tensor_id(name) {
            Some(t) => t,
            None => {
                warn!(tensor = %name, "weight missing during DQ insertion, skipping");
                continue;
            }
        };
        let qw = match quantized_weights.get(name) {
            Some(q) => q,
            None => {
                warn!(tensor = %name, "no quantized data for weight, skipping");
                continue;
            }
        };
        if !graph.tensor(weight).is_constant() {
            warn!(tensor = %name, "weight is not an initializer, skipping");
            continue;
        }

        let scale_dtype = scale.dtype();
        graph.convert_to_variable(weight)?;
        graph.set_tensor_dtype(name, scale_dtype)?;

        let q_const = graph.add_constant(
            format!("{name}_i4"),
            TensorData::I8(qw.clone().into_dyn()),
        )?;
        let s_const = graph.add_constant(format!("{name}_scale"), scale.clone())?;
        graph.add_node(
            format!("{name}_DequantizeLinear"),
            ops.dequantize,
            vec![q_const, s_const],
            vec![weight],
            dq_attrs(block_size),
        )?;
        inserted += 1;
    }

    graph.cleanup();
    graph.toposort()?;
    info!(count = inserted, "inserted DQ nodes");
    Ok(())
}

/// Insert a Quantize -> Dequantize pair after each listed weight,
/// leaving the full-precision initializer in place. Consumers are
/// rewired to read the dequantized value.
pub fn insert_qdq_nodes(
    graph: &mut Graph,
    scales: &HashMap<String, TensorData>,
    block_size: usize,
    ops: QdqOpNames,
) -> Result<()> {
    let mut inserted = 0usize;
    for (name, scale) in scales {
        let weight = match graph.tensor_id(name) {
            Some(t) => t,
            None => {
                warn!(tensor = %name, "weight missing during QDQ insertion, skipping");
                continue;
            }
        };
        if !graph.tensor(weight).is_constant() {
            warn!(tensor = %name, "weight is not an initializer, skipping");
            continue;
        }

        let s_const = graph.add_constant(format!("{name}_scale"), scale.clone())?;
        let q_out = graph.add_variable(
            format!("{name}_QuantizeLinear_Output"),
            super::DataType::I8,
            None,
        )?;
        let dq_out = graph.add_variable(
            format!("{name}_DequantizeLinear_Output"),
            graph.tensor(weight).dtype(),
            None,
        )?;

        let q_node = graph.add_node(
            format!("{name}_QuantizeLinear"),
            ops.quantize,
            vec![weight, s_const],
            vec![q_out],
            dq_attrs(block_size),
        )?;
        graph.rewire_consumers(weight, dq_out, &[q_node]);
        graph.add_node(
            format!("{name}_DequantizeLinear"),
            ops.dequantize,
            vec![q_out, s_const],
            vec![dq_out],
            dq_attrs(block_size),
        )?;
        inserted += 1;
    }

    graph.cleanup();
    graph.toposort()?;
    info!(count = inserted, "inserted Q/DQ node pairs");
    Ok(())
}

/// Insert a Mul ahead of the activation input feeding each quantized
/// matmul, applying the inverse AWQ scale at inference time.
///
/// `input_map` maps weight tensor name to its activation tensor name;
/// `pre_quant_scales` maps weight tensor name to the scale constant.
pub fn insert_pre_quant_scale_nodes(
    graph: &mut Graph,
    input_map: &HashMap<String, String>,
    pre_quant_scales: &HashMap<String, TensorData>,
) -> Result<()> {
    for (weight_name, act_name) in input_map {
        let scale = match pre_quant_scales.get(weight_name) {
            Some(s) => s,
            None => continue,
        };
        let act = match graph.tensor_id(act_name) {
            Some(t) => t,
            None => {
                warn!(tensor = %act_name, "activation missing for pre-quant scale, skipping");
                continue;
            }
        };
        let weight = match graph.tensor_id(weight_name) {
            Some(t) => t,
            None => {
                warn!(tensor = %weight_name, "weight missing for pre-quant scale, skipping");
                continue;
            }
        };

        // The target is the matmul reading both this activation and
        // this (now dequantized) weight
        let targets: Vec<NodeId> = graph
            .consumers(act)
            .iter()
            .copied()
            .filter(|&n| graph.node(n).inputs.contains(&weight))
            .collect();
        if targets.is_empty() {
            debug!(tensor = %weight_name, "no matmul found for pre-quant scale, skipping");
            continue;
        }

        let s_const = graph.add_constant(
            format!("{weight_name}_pre_quant_scale"),
            scale.clone(),
        )?;
        let scaled = graph.add_variable(
            format!("{act_name}_scaled_{weight_name}"),
            graph.tensor(act).dtype(),
            None,
        )?;
        graph.add_node(
            format!("{weight_name}_pre_quant_scale_Mul"),
            "Mul",
            vec![act, s_const],
            vec![scaled],
            BTreeMap::new(),
        )?;
        for target in targets {
            let slots: Vec<usize> = graph
                .node(target)
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, &t)| t == act)
                .map(|(i, _)| i)
                .collect();
            for slot in slots {
                graph.set_node_input(target, slot, scaled)?;
            }
        }
    }

    graph.cleanup();
    graph.toposort()?;
    Ok(())
}

/// Remove the Quantize -> Dequantize pair downstream of each marked
/// producer, rewiring readers back to the producer's original output.
///
/// Entries whose producer no longer exists, or that never received a
/// QDQ pair, are skipped: this is best-effort post-processing over
/// heuristic analysis results, not a correctness-critical path.
pub fn remove_partial_input_qdq(
    graph: &mut Graph,
    no_quantize_inputs: &[NoQuantizeInput],
    ops: QdqOpNames,
) -> Result<()> {
    info!("removing QDQ from marked non-quantizable inputs");
    for entry in no_quantize_inputs {
        let source = match graph.node_id(&entry.producer) {
            Some(n) => n,
            None => {
                debug!(node = %entry.producer, "stale no-quantize producer, skipping");
                continue;
            }
        };
        let source_out = match graph.node(source).outputs.first() {
            Some(&t) => t,
            None => continue,
        };
        // source -> Q -> DQ -> consumers
        let q_node = match graph.consumers(source_out).first() {
            Some(&n) => n,
            None => continue, // reached end of the graph
        };
        let q_out = match graph.node(q_node).outputs.first() {
            Some(&t) => t,
            None => continue,
        };
        let dq_node = match graph.consumers(q_out).first() {
            Some(&n) => n,
            None => continue,
        };
        if graph.node(dq_node).op != ops.dequantize {
            continue;
        }
        let dq_out = match graph.node(dq_node).outputs.first() {
            Some(&t) => t,
            None => continue,
        };
        graph.rewire_consumers(dq_out, source_out, &[]);
    }

    graph.cleanup();
    graph.toposort()?;
    Ok(())
}

/// Wrap a matmul's inputs in casts to f32 and its output in a cast
/// back to f16. The compiler only carries f32 accumulation kernels
/// for fused attention, so both batched matmuls get this treatment.
pub fn insert_matmul_casts(graph: &mut Graph, matmul: NodeId) -> Result<()> {
    use super::DataType;

    let num_inputs = graph.node(matmul).inputs.len().min(2);
    for slot in 0..num_inputs {
        let input = graph.node(matmul).inputs[slot];
        let input_name = graph.tensor(input).name.clone();
        let cast_out = graph.add_variable(
            format!("{input_name}/Cast_output"),
            DataType::F32,
            None,
        )?;
        let mut attrs = BTreeMap::new();
        attrs.insert("to".to_string(), AttrValue::Str("f32".to_string()));
        graph.add_node(
            format!("{input_name}/Cast"),
            "Cast",
            vec![input],
            vec![cast_out],
            attrs,
        )?;
        graph.set_node_input(matmul, slot, cast_out)?;
    }

    let output = graph.node(matmul).outputs[0];
    let output_name = graph.tensor(output).name.clone();
    let cast_in = graph.add_variable(
        format!("{output_name}/Cast_output"),
        DataType::F32,
        None,
    )?;
    graph.set_node_output(matmul, 0, cast_in)?;
    let mut attrs = BTreeMap::new();
    attrs.insert("to".to_string(), AttrValue::Str("f16".to_string()));
    graph.add_node(
        format!("{output_name}/Cast"),
        "Cast",
        vec![cast_in],
        vec![output],
        attrs,
    )?;
    Ok(())
}

/// Summary of quantized nodes in a graph
#[derive(Clone, Debug, Default)]
pub struct QuantizationStats {
    pub total: usize,
    pub by_op: BTreeMap<String, usize>,
    pub nodes: Vec<String>,
}

/// Count nodes consuming a dequantized value, grouped by op type
pub fn collect_quantization_stats(graph: &Graph) -> QuantizationStats {
    let dequant_ops = [QdqOpNames::onnx().dequantize, QdqOpNames::trt().dequantize];
    let mut stats = QuantizationStats::default();
    for (_, node) in graph.node_entries() {
        let fed_by_dq = node.inputs.iter().any(|&t| {
            graph
                .producer(t)
                .is_some_and(|p| dequant_ops.contains(&graph.node(p).op.as_str()))
        });
        if fed_by_dq && !dequant_ops.contains(&node.op.as_str()) {
            *stats.by_op.entry(node.op.clone()).or_insert(0) += 1;
            stats.nodes.push(node.name.clone());
            stats.total += 1;
        }
    }
    stats
}
