//! MHA exclusion and residual classification end-to-end

use std::collections::BTreeMap;

use afinar::analyze::{
    build_non_residual_input_map, find_mha_partitions, find_nodes_from_mha_to_exclude,
    MhaExcludeOptions,
};
use afinar::quant::ReferenceSessionFactory;
use afinar::{DataType, Graph, TensorId};

fn var(g: &mut Graph, name: &str, shape: &[i64]) -> TensorId {
    g.add_variable(name, DataType::F32, Some(shape.to_vec()))
        .unwrap()
}

fn node(g: &mut Graph, name: &str, op: &str, inputs: &[TensorId], outputs: &[TensorId]) {
    g.add_node(name, op, inputs.to_vec(), outputs.to_vec(), BTreeMap::new())
        .unwrap();
}

/// Attention block with a configurable head size; `masked` adds a
/// mask-add between BMM1 and the softmax.
fn attention_graph(head_size: i64, masked: bool) -> Graph {
    let mut g = Graph::new("attn");
    let seq = 8i64;
    let q = var(&mut g, "q", &[1, 2, seq, head_size]);
    let k = var(&mut g, "k", &[1, 2, head_size, seq]);
    let v = var(&mut g, "v", &[1, 2, seq, head_size]);
    let scores = var(&mut g, "scores", &[1, 2, seq, seq]);
    node(&mut g, "bmm1", "MatMul", &[q, k], &[scores]);

    let softmax_in = if masked {
        let mask = var(&mut g, "mask", &[1, 2, seq, seq]);
        let masked_scores = var(&mut g, "masked_scores", &[1, 2, seq, seq]);
        node(&mut g, "mask_add", "Add", &[scores, mask], &[masked_scores]);
        masked_scores
    } else {
        scores
    };

    let probs = var(&mut g, "probs", &[1, 2, seq, seq]);
    node(&mut g, "softmax", "Softmax", &[softmax_in], &[probs]);
    let out = var(&mut g, "out", &[1, 2, seq, head_size]);
    node(&mut g, "bmm2", "MatMul", &[probs, v], &[out]);

    let mut inputs = vec![q, k, v];
    if masked {
        inputs.push(g.tensor_id("mask").unwrap());
    }
    g.set_inputs(inputs);
    g.set_outputs(vec![out]);
    g
}

fn excluded_names(graph: &Graph) -> Vec<String> {
    find_nodes_from_mha_to_exclude(
        graph,
        &ReferenceSessionFactory::default(),
        vec![],
        &MhaExcludeOptions::default(),
    )
    .unwrap()
}

#[test]
fn detects_single_partition_in_order() {
    let g = attention_graph(64, false);
    let partitions = find_mha_partitions(&g);
    assert_eq!(partitions.len(), 1);
    let names: Vec<&str> = partitions[0]
        .iter()
        .map(|&n| g.node(n).name.as_str())
        .collect();
    assert_eq!(names, vec!["bmm1", "softmax", "bmm2"]);
}

#[test]
fn aligned_head_size_keeps_qdq() {
    // head 64, no mask: multiple of 16 and under 128, stays quantized
    let g = attention_graph(64, false);
    assert!(excluded_names(&g).is_empty());
}

#[test]
fn unaligned_head_size_is_excluded() {
    // head 72 is not a multiple of 16
    let g = attention_graph(72, false);
    assert_eq!(
        excluded_names(&g),
        vec!["bmm1".to_string(), "bmm2".to_string()]
    );
}

#[test]
fn oversized_head_is_excluded() {
    // head 144 is a multiple of 16 but over 128
    let g = attention_graph(144, false);
    assert_eq!(
        excluded_names(&g),
        vec!["bmm1".to_string(), "bmm2".to_string()]
    );
}

#[test]
fn masked_attention_with_head_64_keeps_qdq() {
    let g = attention_graph(64, true);
    assert!(excluded_names(&g).is_empty());
}

#[test]
fn masked_attention_with_other_head_is_excluded() {
    // mask-add present and head size != 64
    let g = attention_graph(32, true);
    assert_eq!(
        excluded_names(&g),
        vec!["bmm1".to_string(), "bmm2".to_string()]
    );
}

#[test]
fn residual_map_end_to_end() {
    // conv1 -> relu -> conv2 -> add, with a skip edge conv1 -> add.
    // The deeper conv2 branch is the non-residual input.
    let mut g = Graph::new("res");
    let x = var(&mut g, "x", &[1, 8]);
    let w1 = g
        .add_constant(
            "w1",
            afinar::TensorData::F32(ndarray::ArrayD::from_elem(ndarray::IxDyn(&[1]), 1.0f32)),
        )
        .unwrap();
    let w2 = g
        .add_constant(
            "w2",
            afinar::TensorData::F32(ndarray::ArrayD::from_elem(ndarray::IxDyn(&[1]), 1.0f32)),
        )
        .unwrap();
    let c1 = var(&mut g, "c1", &[1, 8]);
    let r = var(&mut g, "r", &[1, 8]);
    let c2 = var(&mut g, "c2", &[1, 8]);
    let sum = var(&mut g, "sum", &[1, 8]);
    node(&mut g, "conv1", "Conv", &[x, w1], &[c1]);
    node(&mut g, "relu", "Relu", &[c1], &[r]);
    node(&mut g, "conv2", "Conv", &[r, w2], &[c2]);
    node(&mut g, "residual_add", "Add", &[c2, c1], &[sum]);
    g.set_inputs(vec![x]);
    g.set_outputs(vec![sum]);

    let map = build_non_residual_input_map(&g);
    assert_eq!(map.len(), 1);
    assert_eq!(map["residual_add"], Some("c2".to_string()));
}
