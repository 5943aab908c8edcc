//! Attention-partition discovery and exclusion
//!
//! MHA is recognized as `MatMul -> (scale/mask ops) -> Softmax ->
//! (Cast) -> MatMul`. Whether the pair of batched matmuls can keep
//! QDQ depends on runtime shapes (head size, sequence length), so the
//! decision table runs real inference over random feeds to observe
//! BMM1's second input. The thresholds mirror the backend's fused
//! attention kernel support and must not drift.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use tracing::info;

use crate::graph::pattern::{has_path_type, Direction};
use crate::graph::{Graph, NodeId};
use crate::io;
use crate::quant::calib::random_feed;
use crate::quant::session::SessionFactory;
use crate::{Error, Result};

/// Ops traversed transparently inside an attention block
const MHA_WILD_CARD_TYPES: [&str; 9] = [
    "Div",
    "Mul",
    "ConstMul",
    "Add",
    "BiasAdd",
    "Reshape",
    "Transpose",
    "Flatten",
    "Cast",
];

const MHA_CHAIN_TYPE: [&str; 3] = ["MatMul", "Softmax", "MatMul"];
const MASKADD_CHAIN_TYPE: [&str; 3] = ["MatMul", "Add", "Softmax"];
const RESHAPE_ADD_RESHAPE_CHAIN_TYPE: [&str; 5] =
    ["MatMul", "Reshape", "Add", "Reshape", "Softmax"];

/// Find BMM1 -> Softmax -> BMM2 partitions
pub fn find_mha_partitions(graph: &Graph) -> Vec<[NodeId; 3]> {
    let mut partitions = Vec::new();
    for (id, node) in graph.node_entries() {
        if node.op != "MatMul" {
            continue;
        }
        let mut path = Vec::new();
        if has_path_type(
            graph,
            id,
            &MHA_CHAIN_TYPE,
            Direction::Forward,
            &MHA_WILD_CARD_TYPES,
            &mut path,
        ) && path.len() == 3
            && graph.node(path[0]).op == "MatMul"
            && graph.node(path[2]).op == "MatMul"
        {
            partitions.push([path[0], path[1], path[2]]);
        }
    }
    partitions
}

/// Options for MHA exclusion
#[derive(Clone, Debug)]
pub struct MhaExcludeOptions {
    /// Exclude both matmuls of every MHA unconditionally
    pub disable_mha_qdq: bool,
    /// Apply the head-size/sequence-length kernel-support table
    pub enforce_kernel_limits: bool,
    /// Write the shape-probe model with an external-data side file
    pub use_external_data_format: bool,
    /// Seed for the random probe inputs
    pub seed: u64,
}

impl Default for MhaExcludeOptions {
    fn default() -> Self {
        Self {
            disable_mha_qdq: false,
            enforce_kernel_limits: true,
            use_external_data_format: false,
            seed: 0,
        }
    }
}

/// Collect the names of MHA matmuls that must stay unquantized.
///
/// With `disable_mha_qdq`, every partition's BMM1 and BMM2 are
/// excluded. Otherwise the graph runs once over random inputs to
/// observe each BMM1's second-input shape, and the decision table
/// applies:
///
/// - mask-add present and a reshape/add/reshape sub-pattern too: exclude
/// - mask-add present and (head size != 64 or seq len > 512): exclude
/// - no mask-add and (head size not a multiple of 16, or > 128): exclude
pub fn find_nodes_from_mha_to_exclude(
    graph: &Graph,
    sessions: &dyn SessionFactory,
    nodes_to_exclude: Vec<String>,
    opts: &MhaExcludeOptions,
) -> Result<Vec<String>> {
    let mha_partitions = find_mha_partitions(graph);
    if mha_partitions.is_empty() {
        return Ok(Vec::new());
    }

    let mut excluded: BTreeSet<String> = nodes_to_exclude.into_iter().collect();

    if opts.disable_mha_qdq {
        for partition in &mha_partitions {
            excluded.insert(graph.node(partition[0]).name.clone());
            excluded.insert(graph.node(partition[2]).name.clone());
        }
        return Ok(excluded.into_iter().collect());
    }

    if !opts.enforce_kernel_limits {
        return Ok(excluded.into_iter().collect());
    }

    // Probe BMM1 second-input shapes at runtime: extend the graph
    // outputs, run once over random feeds, read the shapes back.
    let mut probed = graph.clone();
    let mut probe_names = Vec::new();
    for partition in &mha_partitions {
        let bmm1 = graph.node(partition[0]);
        let input1 = bmm1.inputs.get(1).copied().ok_or_else(|| {
            Error::Graph(format!("MatMul '{}' has no second input", bmm1.name))
        })?;
        let name = graph.tensor(input1).name.clone();
        if let Some(tid) = probed.tensor_id(&name) {
            probed.add_output(tid);
        }
        probe_names.push(name);
    }

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let feed = random_feed(graph, &mut rng);

    let probe_path = io::temp_model_path("mha_probe")?;
    let probe_result = (|| {
        io::save_graph(&probed, &probe_path, opts.use_external_data_format)?;
        let mut session = sessions.create(&probe_path)?;
        session.run(&probe_names, &feed)
    })();
    io::remove_intermediate_files(&[
        probe_path.clone(),
        io::external_data_path(&probe_path),
    ]);
    let outputs = probe_result?;

    for (partition, bmm1_input) in mha_partitions.iter().zip(outputs.iter()) {
        let shape = bmm1_input.shape();
        if shape.len() < 2 {
            continue;
        }
        let seq_len = shape[shape.len() - 1];
        let head_size = shape[shape.len() - 2];

        let bmm1 = partition[0];
        let mut enable_mha_qdq = true;

        let mut maskadd_partition = Vec::new();
        if has_path_type(
            graph,
            bmm1,
            &MASKADD_CHAIN_TYPE,
            Direction::Forward,
            &MHA_WILD_CARD_TYPES,
            &mut maskadd_partition,
        ) {
            let mut reshape_partition = Vec::new();
            if has_path_type(
                graph,
                bmm1,
                &RESHAPE_ADD_RESHAPE_CHAIN_TYPE,
                Direction::Forward,
                &MHA_WILD_CARD_TYPES,
                &mut reshape_partition,
            ) {
                enable_mha_qdq = false;
            } else if head_size != 64 || seq_len > 512 {
                enable_mha_qdq = false;
            }
        } else if head_size % 16 != 0 || head_size > 128 {
            enable_mha_qdq = false;
        }

        if !enable_mha_qdq {
            excluded.insert(graph.node(partition[0]).name.clone());
            excluded.insert(graph.node(partition[2]).name.clone());
        }
    }

    info!(count = excluded.len(), "MHA exclusion list built");
    Ok(excluded.into_iter().collect())
}

/// Expand node names matching the given anchored-regex patterns
pub fn expand_node_names_from_patterns(
    graph: &Graph,
    name_patterns: &[String],
) -> Result<Vec<String>> {
    let mut matched = Vec::new();
    for pattern in name_patterns {
        let re = Regex::new(&format!("^(?:{pattern})"))
            .map_err(|e| Error::Config(format!("bad node pattern '{pattern}': {e}")))?;
        for (_, node) in graph.node_entries() {
            if re.is_match(&node.name) {
                matched.push(node.name.clone());
            }
        }
    }
    Ok(matched)
}

/// Resolve the user's exclusion surface: name patterns plus op types,
/// deduplicated.
pub fn find_nodes_to_exclude(
    graph: &Graph,
    nodes_to_exclude: &[String],
    op_types_to_exclude: &[String],
) -> Result<Vec<String>> {
    let mut names: BTreeSet<String> = expand_node_names_from_patterns(graph, nodes_to_exclude)?
        .into_iter()
        .collect();
    for (_, node) in graph.node_entries() {
        if op_types_to_exclude.contains(&node.op) {
            names.insert(node.name.clone());
        }
    }
    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataType, TensorData, TensorId};
    use ndarray::ArrayD;
    use std::collections::BTreeMap;

    fn var(g: &mut Graph, name: &str) -> TensorId {
        g.add_variable(name, DataType::F32, None).unwrap()
    }

    fn konst(g: &mut Graph, name: &str, shape: &[usize]) -> TensorId {
        let n: usize = shape.iter().product();
        let data =
            ArrayD::from_shape_vec(ndarray::IxDyn(shape), vec![0.1; n]).unwrap();
        g.add_constant(name, TensorData::F32(data)).unwrap()
    }

    fn node(g: &mut Graph, name: &str, op: &str, inputs: &[TensorId], outputs: &[TensorId]) {
        g.add_node(name, op, inputs.to_vec(), outputs.to_vec(), BTreeMap::new())
            .unwrap();
    }

    #[test]
    fn test_detects_simple_mha() {
        let mut g = Graph::new("mha");
        let q = var(&mut g, "q");
        let k = var(&mut g, "k");
        let v = var(&mut g, "v");
        let s0 = var(&mut g, "s0");
        let s1 = var(&mut g, "s1");
        let out = var(&mut g, "out");
        node(&mut g, "bmm1", "MatMul", &[q, k], &[s0]);
        node(&mut g, "softmax", "Softmax", &[s0], &[s1]);
        node(&mut g, "bmm2", "MatMul", &[s1, v], &[out]);

        let partitions = find_mha_partitions(&g);
        assert_eq!(partitions.len(), 1);
        assert_eq!(g.node(partitions[0][0]).name, "bmm1");
        assert_eq!(g.node(partitions[0][1]).name, "softmax");
        assert_eq!(g.node(partitions[0][2]).name, "bmm2");
    }

    #[test]
    fn test_detects_mha_with_scale_and_mask() {
        // bmm1 -> Div -> Add(mask) -> Softmax -> Cast -> bmm2, all
        // intermediates covered by wildcards
        let mut g = Graph::new("mha");
        let q = var(&mut g, "q");
        let k = var(&mut g, "k");
        let v = var(&mut g, "v");
        let mask = var(&mut g, "mask");
        let t0 = var(&mut g, "t0");
        let t1 = var(&mut g, "t1");
        let t2 = var(&mut g, "t2");
        let t3 = var(&mut g, "t3");
        let t4 = var(&mut g, "t4");
        let out = var(&mut g, "out");
        let scale = konst(&mut g, "scale", &[1]);
        node(&mut g, "bmm1", "MatMul", &[q, k], &[t0]);
        node(&mut g, "div", "Div", &[t0, scale], &[t1]);
        node(&mut g, "mask_add", "Add", &[t1, mask], &[t2]);
        node(&mut g, "softmax", "Softmax", &[t2], &[t3]);
        node(&mut g, "cast", "Cast", &[t3], &[t4]);
        node(&mut g, "bmm2", "MatMul", &[t4, v], &[out]);

        let partitions = find_mha_partitions(&g);
        assert_eq!(partitions.len(), 1);
        assert_eq!(g.node(partitions[0][2]).name, "bmm2");
    }

    #[test]
    fn test_no_partition_without_softmax() {
        let mut g = Graph::new("plain");
        let x = var(&mut g, "x");
        let w = konst(&mut g, "w", &[4, 4]);
        let h = var(&mut g, "h");
        let y = var(&mut g, "y");
        node(&mut g, "mm1", "MatMul", &[x, w], &[h]);
        node(&mut g, "relu", "Relu", &[h], &[y]);

        assert!(find_mha_partitions(&g).is_empty());
    }

    #[test]
    fn test_disable_flag_excludes_both_matmuls() {
        let mut g = Graph::new("mha");
        let q = var(&mut g, "q");
        let k = var(&mut g, "k");
        let v = var(&mut g, "v");
        let s0 = var(&mut g, "s0");
        let s1 = var(&mut g, "s1");
        let out = var(&mut g, "out");
        node(&mut g, "bmm1", "MatMul", &[q, k], &[s0]);
        node(&mut g, "softmax", "Softmax", &[s0], &[s1]);
        node(&mut g, "bmm2", "MatMul", &[s1, v], &[out]);
        g.set_inputs(vec![q, k, v]);
        g.set_outputs(vec![out]);

        let opts = MhaExcludeOptions {
            disable_mha_qdq: true,
            ..Default::default()
        };
        let excluded = find_nodes_from_mha_to_exclude(
            &g,
            &crate::quant::session::ReferenceSessionFactory::default(),
            vec![],
            &opts,
        )
        .unwrap();
        assert_eq!(excluded, vec!["bmm1".to_string(), "bmm2".to_string()]);
    }

    #[test]
    fn test_expand_patterns_anchored() {
        let mut g = Graph::new("names");
        let a = var(&mut g, "a");
        let b = var(&mut g, "b");
        let c = var(&mut g, "c");
        node(&mut g, "encoder/mm1", "MatMul", &[a], &[b]);
        node(&mut g, "decoder/mm1", "MatMul", &[a], &[c]);

        let names =
            expand_node_names_from_patterns(&g, &["encoder/.*".to_string()]).unwrap();
        assert_eq!(names, vec!["encoder/mm1".to_string()]);

        assert!(expand_node_names_from_patterns(&g, &["[".to_string()]).is_err());
    }

    #[test]
    fn test_find_nodes_to_exclude_merges_and_dedups() {
        let mut g = Graph::new("names");
        let a = var(&mut g, "a");
        let b = var(&mut g, "b");
        let c = var(&mut g, "c");
        node(&mut g, "mm", "MatMul", &[a], &[b]);
        node(&mut g, "soft", "Softmax", &[b], &[c]);

        let excluded = find_nodes_to_exclude(
            &g,
            &["mm".to_string()],
            &["MatMul".to_string(), "Softmax".to_string()],
        )
        .unwrap();
        assert_eq!(excluded, vec!["mm".to_string(), "soft".to_string()]);
    }
}
