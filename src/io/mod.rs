//! Graph model I/O
//!
//! The on-disk format is a JSON metadata file describing nodes,
//! values and initializers, optionally paired with a raw
//! little-endian side file (`<model>.data`) holding large weight
//! payloads referenced by offset and length.

mod format;
mod load;
mod save;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub use format::{
    AttrDef, GraphDef, GraphFile, InitializerDef, NodeDef, TensorPayload, ValueDef, IR_VERSION,
};
pub use load::load_graph;
pub use save::save_graph;

/// Side-file path for a model's external weight data
pub fn external_data_path(model_path: &Path) -> PathBuf {
    let mut name = model_path.as_os_str().to_owned();
    name.push(".data");
    PathBuf::from(name)
}

/// Create a unique temporary model path. The caller owns deletion;
/// pair with `remove_intermediate_files`.
pub fn temp_model_path(prefix: &str) -> crate::Result<PathBuf> {
    let temp = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".json")
        .tempfile()?
        .into_temp_path();
    let path = temp.to_path_buf();
    temp.keep().map_err(|e| crate::Error::Io(e.error))?;
    Ok(path)
}

/// Delete intermediate artifacts. A missing file is a warning, never
/// an error; deletion failures do not propagate.
pub fn remove_intermediate_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed intermediate file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "intermediate file was not found")
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove intermediate file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataType, Graph, TensorData};
    use ndarray::ArrayD;
    use std::collections::BTreeMap;

    fn sample_graph() -> Graph {
        let mut g = Graph::new("sample");
        let x = g
            .add_variable("x", DataType::F32, Some(vec![1, 4]))
            .unwrap();
        let data = ArrayD::from_shape_vec(
            ndarray::IxDyn(&[4, 2]),
            (0..8).map(|v| v as f32 * 0.25).collect(),
        )
        .unwrap();
        let w = g.add_constant("w", TensorData::F32(data)).unwrap();
        let y = g.add_variable("y", DataType::F32, None).unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert("transB".to_string(), crate::graph::AttrValue::Int(0));
        g.add_node("mm", "MatMul", vec![x, w], vec![y], attrs).unwrap();
        g.set_inputs(vec![x]);
        g.set_outputs(vec![y]);
        g
    }

    #[test]
    fn test_save_load_round_trip_inline() {
        let g = sample_graph();
        let path = temp_model_path("roundtrip").unwrap();
        save_graph(&g, &path, false).unwrap();

        let loaded = load_graph(&path, false).unwrap();
        assert_eq!(loaded.name, "sample");
        assert_eq!(loaded.num_nodes(), 1);
        let w = loaded.tensor_id("w").unwrap();
        let data = loaded.tensor(w).data().unwrap();
        assert_eq!(data.shape(), &[4, 2]);
        assert_eq!(data.to_f32(), g.tensor(g.tensor_id("w").unwrap()).data().unwrap().to_f32());
        let mm = loaded.node_id("mm").unwrap();
        assert_eq!(loaded.node(mm).attr_int("transB"), Some(0));

        remove_intermediate_files(&[path]);
    }

    #[test]
    fn test_save_load_round_trip_external_data() {
        let g = sample_graph();
        let path = temp_model_path("external").unwrap();
        save_graph(&g, &path, true).unwrap();
        assert!(external_data_path(&path).exists());

        let loaded = load_graph(&path, true).unwrap();
        let w = loaded.tensor_id("w").unwrap();
        let data = loaded.tensor(w).data().unwrap();
        assert_eq!(data.to_f32(), g.tensor(g.tensor_id("w").unwrap()).data().unwrap().to_f32());

        remove_intermediate_files(&[path.clone(), external_data_path(&path)]);
        assert!(!path.exists());
    }

    #[test]
    fn test_load_external_without_side_file_errors() {
        let g = sample_graph();
        let path = temp_model_path("missing_side").unwrap();
        save_graph(&g, &path, true).unwrap();
        std::fs::remove_file(external_data_path(&path)).unwrap();

        assert!(load_graph(&path, true).is_err());
        remove_intermediate_files(&[path]);
    }

    #[test]
    fn test_remove_missing_file_is_nonfatal() {
        remove_intermediate_files(&[PathBuf::from("/nonexistent/afinar_test_file")]);
    }

    #[test]
    fn test_round_trip_preserves_io_lists() {
        let g = sample_graph();
        let path = temp_model_path("iolists").unwrap();
        save_graph(&g, &path, false).unwrap();
        let loaded = load_graph(&path, false).unwrap();

        let input_names: Vec<&str> = loaded
            .inputs()
            .iter()
            .map(|&t| loaded.tensor(t).name.as_str())
            .collect();
        let output_names: Vec<&str> = loaded
            .outputs()
            .iter()
            .map(|&t| loaded.tensor(t).name.as_str())
            .collect();
        assert_eq!(input_names, vec!["x"]);
        assert_eq!(output_names, vec!["y"]);

        remove_intermediate_files(&[path]);
    }

    #[test]
    fn test_f16_and_i8_payload_round_trip() {
        use half::f16;
        let mut g = Graph::new("typed");
        let q = g
            .add_constant(
                "q",
                TensorData::I8(ArrayD::from_shape_vec(ndarray::IxDyn(&[2, 2]), vec![-8i8, 7, 0, 1]).unwrap()),
            )
            .unwrap();
        let s = g
            .add_constant(
                "s",
                TensorData::F16(ArrayD::from_elem(ndarray::IxDyn(&[1, 2]), f16::from_f32(0.5))),
            )
            .unwrap();
        let y = g.add_variable("y", DataType::F16, None).unwrap();
        g.add_node(
            "dq",
            "DequantizeLinear",
            vec![q, s],
            vec![y],
            BTreeMap::new(),
        )
        .unwrap();
        g.set_outputs(vec![y]);

        let path = temp_model_path("typed").unwrap();
        save_graph(&g, &path, false).unwrap();
        let loaded = load_graph(&path, false).unwrap();

        let q = loaded.tensor_id("q").unwrap();
        assert_eq!(loaded.tensor(q).data().unwrap().dtype(), DataType::I8);
        let s = loaded.tensor_id("s").unwrap();
        let s_data = loaded.tensor(s).data().unwrap();
        assert_eq!(s_data.dtype(), DataType::F16);
        assert_eq!(s_data.to_f32()[[0, 0]], 0.5);

        remove_intermediate_files(&[path]);
    }
}
