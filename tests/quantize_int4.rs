//! End-to-end INT4 quantization through the file-based entry point

use std::collections::BTreeMap;

use afinar::graph::qdq::collect_quantization_stats;
use afinar::quant::ReferenceSessionFactory;
use afinar::{io, quantize, CalibrationMethod, DataType, Graph, QuantizeConfig, TensorData};
use ndarray::ArrayD;

/// [MatMul(weight 256x64)] -> [Softmax], the reference scenario
fn two_node_model() -> Graph {
    let mut g = Graph::new("two_node");
    let x = g
        .add_variable("x", DataType::F32, Some(vec![1, 256]))
        .unwrap();
    let data = ArrayD::from_shape_vec(
        ndarray::IxDyn(&[256, 64]),
        (0..256 * 64).map(|v| (v as f32 * 0.117).sin()).collect(),
    )
    .unwrap();
    let w = g.add_constant("w", TensorData::F32(data)).unwrap();
    let h = g.add_variable("h", DataType::F32, None).unwrap();
    let y = g.add_variable("y", DataType::F32, None).unwrap();
    g.add_node("mm1", "MatMul", vec![x, w], vec![h], BTreeMap::new())
        .unwrap();
    g.add_node("sm", "Softmax", vec![h], vec![y], BTreeMap::new())
        .unwrap();
    g.set_inputs(vec![x]);
    g.set_outputs(vec![y]);
    g
}

fn write_model(graph: &Graph, prefix: &str) -> std::path::PathBuf {
    let path = io::temp_model_path(prefix).unwrap();
    io::save_graph(graph, &path, false).unwrap();
    path
}

#[test]
fn rtn_dq_replaces_weight_with_dequantize() {
    let model = two_node_model();
    let path = write_model(&model, "rtn_dq_e2e");

    let config = QuantizeConfig {
        calibration_method: CalibrationMethod::RtnDq,
        block_size: 128,
        ..Default::default()
    };
    let quantized = quantize(&path, &config, None, &ReferenceSessionFactory::default()).unwrap();

    // The weight initializer is replaced by a DequantizeLinear whose
    // inputs are an int8-range array [256, 64] and scales [2, 64]
    let dq = quantized
        .node_id("w_DequantizeLinear")
        .expect("DequantizeLinear inserted");
    let dq_node = quantized.node(dq);
    assert_eq!(dq_node.op, "DequantizeLinear");
    assert_eq!(dq_node.attr_int("axis"), Some(0));
    assert_eq!(dq_node.attr_int("block_size"), Some(128));

    let qw = quantized.tensor(dq_node.inputs[0]).data().unwrap();
    assert_eq!(qw.dtype(), DataType::I8);
    assert_eq!(qw.shape(), &[256, 64]);
    match qw {
        TensorData::I8(a) => assert!(a.iter().all(|&v| (-8..=7).contains(&v))),
        other => panic!("expected i8 payload, got {:?}", other.dtype()),
    }

    let scale = quantized.tensor(dq_node.inputs[1]).data().unwrap();
    assert_eq!(scale.shape(), &[2, 64]);

    let w = quantized.tensor_id("w").unwrap();
    assert!(!quantized.tensor(w).is_constant());
    assert_eq!(quantized.producer(w), Some(dq));

    // The graph still round-trips through the file format
    let out_path = io::temp_model_path("rtn_dq_out").unwrap();
    io::save_graph(&quantized, &out_path, false).unwrap();
    let reloaded = io::load_graph(&out_path, false).unwrap();
    assert!(reloaded.node_id("w_DequantizeLinear").is_some());

    let stats = collect_quantization_stats(&reloaded);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_op.get("MatMul"), Some(&1));

    io::remove_intermediate_files(&[path, out_path]);
}

#[test]
fn rtn_inserts_full_qdq_pair() {
    let model = two_node_model();
    let path = write_model(&model, "rtn_e2e");

    let config = QuantizeConfig {
        calibration_method: CalibrationMethod::Rtn,
        block_size: 128,
        ..Default::default()
    };
    let quantized = quantize(&path, &config, None, &ReferenceSessionFactory::default()).unwrap();

    assert!(quantized.node_id("w_QuantizeLinear").is_some());
    assert!(quantized.node_id("w_DequantizeLinear").is_some());
    // The fp32 weight stays in place as the quantize input
    let w = quantized.tensor_id("w").unwrap();
    assert!(quantized.tensor(w).is_constant());

    io::remove_intermediate_files(&[path]);
}

#[test]
fn rtn_trt_dq_uses_custom_op_names() {
    let model = two_node_model();
    let path = write_model(&model, "rtn_trt_e2e");

    let config = QuantizeConfig {
        calibration_method: CalibrationMethod::RtnTrtDq,
        block_size: 128,
        ..Default::default()
    };
    let quantized = quantize(&path, &config, None, &ReferenceSessionFactory::default()).unwrap();

    let dq = quantized.node_id("w_DequantizeLinear").unwrap();
    assert_eq!(quantized.node(dq).op, "TRT_INT4DequantizeLinear");

    io::remove_intermediate_files(&[path]);
}

#[test]
fn unsupported_method_name_fails_fast() {
    let err = "magic".parse::<CalibrationMethod>().unwrap_err();
    assert!(err.to_string().contains("Unsupported calibration method"));
    assert!(err.to_string().contains("magic"));
}

#[test]
fn model_without_quantizable_nodes_passes_through() {
    let mut g = Graph::new("plain");
    let x = g.add_variable("x", DataType::F32, Some(vec![1, 8])).unwrap();
    let y = g.add_variable("y", DataType::F32, None).unwrap();
    g.add_node("relu", "Relu", vec![x], vec![y], BTreeMap::new())
        .unwrap();
    g.set_inputs(vec![x]);
    g.set_outputs(vec![y]);
    let path = write_model(&g, "plain_e2e");

    let config = QuantizeConfig {
        calibration_method: CalibrationMethod::RtnDq,
        ..Default::default()
    };
    let out = quantize(&path, &config, None, &ReferenceSessionFactory::default()).unwrap();
    assert_eq!(out.num_nodes(), 1);
    assert_eq!(collect_quantization_stats(&out).total, 0);

    io::remove_intermediate_files(&[path]);
}

#[test]
fn external_data_round_trip_through_quantization() {
    let model = two_node_model();
    let path = io::temp_model_path("rtn_ext").unwrap();
    io::save_graph(&model, &path, true).unwrap();

    let config = QuantizeConfig {
        calibration_method: CalibrationMethod::RtnDq,
        use_external_data_format: true,
        ..Default::default()
    };
    let sessions = ReferenceSessionFactory {
        use_external_data_format: true,
    };
    let quantized = quantize(&path, &config, None, &sessions).unwrap();
    assert!(quantized.node_id("w_DequantizeLinear").is_some());

    io::remove_intermediate_files(&[path.clone(), io::external_data_path(&path)]);
}
