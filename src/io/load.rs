//! Graph loading

use std::collections::BTreeMap;
use std::path::Path;

use half::f16;
use ndarray::{ArrayD, IxDyn};
use tracing::warn;

use super::external_data_path;
use super::format::{AttrDef, GraphFile, InitializerDef, TensorPayload, IR_VERSION};
use crate::graph::{AttrValue, DataType, Graph, TensorData, TensorId};
use crate::{Error, Result};

/// Deserialize a graph from `path`. External payload references are
/// resolved against the `<model>.data` side file when
/// `load_external_data` is set; otherwise they are an error.
pub fn load_graph(path: impl AsRef<Path>, load_external_data: bool) -> Result<Graph> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)?;
    let file: GraphFile = serde_json::from_str(&json)
        .map_err(|e| Error::Serialization(format!("graph deserialization failed: {e}")))?;

    if file.ir_version > IR_VERSION {
        warn!(
            found = file.ir_version,
            supported = IR_VERSION,
            "model was written by a newer format revision"
        );
    }

    let mut side_file: Option<Vec<u8>> = None;
    if load_external_data
        && file
            .graph
            .initializers
            .iter()
            .any(|init| matches!(init.payload, TensorPayload::External { .. }))
    {
        side_file = Some(std::fs::read(external_data_path(path))?);
    }

    let def = file.graph;
    let mut graph = Graph::new(def.name);

    for value in &def.values {
        graph.add_variable(
            value.name.clone(),
            DataType::parse(&value.dtype)?,
            value.shape.clone(),
        )?;
    }
    for init in &def.initializers {
        let data = decode_initializer(init, side_file.as_deref(), load_external_data)?;
        graph.add_constant(init.name.clone(), data)?;
    }

    for node in &def.nodes {
        let inputs = node
            .inputs
            .iter()
            .map(|name| resolve_tensor(&mut graph, name))
            .collect::<Result<Vec<_>>>()?;
        let outputs = node
            .outputs
            .iter()
            .map(|name| resolve_tensor(&mut graph, name))
            .collect::<Result<Vec<_>>>()?;
        let attrs: BTreeMap<String, AttrValue> = node
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), attr_value(v)))
            .collect();
        graph.add_node(node.name.clone(), node.op.clone(), inputs, outputs, attrs)?;
    }

    let inputs = def
        .inputs
        .iter()
        .map(|name| {
            graph
                .tensor_id(name)
                .ok_or_else(|| Error::MissingTensor(name.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    graph.set_inputs(inputs);
    let outputs = def
        .outputs
        .iter()
        .map(|name| {
            graph
                .tensor_id(name)
                .ok_or_else(|| Error::MissingTensor(name.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    graph.set_outputs(outputs);

    graph.toposort()?;
    Ok(graph)
}

/// Tensors referenced by nodes but not declared fall back to untyped
/// variables, tolerating hand-written model files
fn resolve_tensor(graph: &mut Graph, name: &str) -> Result<TensorId> {
    match graph.tensor_id(name) {
        Some(id) => Ok(id),
        None => graph.add_variable(name.to_string(), DataType::F32, None),
    }
}

fn attr_value(def: &AttrDef) -> AttrValue {
    match def {
        AttrDef::Int(v) => AttrValue::Int(*v),
        AttrDef::Float(v) => AttrValue::Float(*v),
        AttrDef::Ints(v) => AttrValue::Ints(v.clone()),
        AttrDef::Str(v) => AttrValue::Str(v.clone()),
    }
}

fn decode_initializer(
    init: &InitializerDef,
    side_file: Option<&[u8]>,
    load_external_data: bool,
) -> Result<TensorData> {
    let shape = IxDyn(&init.shape);
    let dtype = DataType::parse(&init.dtype)?;

    let from_shape = |err: ndarray::ShapeError| {
        Error::Serialization(format!("initializer '{}': {err}", init.name))
    };

    match &init.payload {
        TensorPayload::F32 { values } => Ok(TensorData::F32(
            ArrayD::from_shape_vec(shape, values.clone()).map_err(from_shape)?,
        )),
        TensorPayload::F16 { bits } => Ok(TensorData::F16(
            ArrayD::from_shape_vec(shape, bits.iter().map(|&b| f16::from_bits(b)).collect())
                .map_err(from_shape)?,
        )),
        TensorPayload::I8 { values } => Ok(TensorData::I8(
            ArrayD::from_shape_vec(shape, values.clone()).map_err(from_shape)?,
        )),
        TensorPayload::I64 { values } => Ok(TensorData::I64(
            ArrayD::from_shape_vec(shape, values.clone()).map_err(from_shape)?,
        )),
        TensorPayload::External { offset, length } => {
            if !load_external_data {
                return Err(Error::Serialization(format!(
                    "initializer '{}' references external data but loading it is disabled",
                    init.name
                )));
            }
            let bytes = side_file.ok_or_else(|| {
                Error::Serialization("external data side file missing".to_string())
            })?;
            let start = *offset as usize;
            let end = start + *length as usize;
            let slice = bytes.get(start..end).ok_or_else(|| {
                Error::Serialization(format!(
                    "initializer '{}' external range out of bounds",
                    init.name
                ))
            })?;
            decode_raw(slice, dtype, shape, &init.name)
        }
    }
}

fn decode_raw(bytes: &[u8], dtype: DataType, shape: IxDyn, name: &str) -> Result<TensorData> {
    let bad_cast =
        |_| Error::Serialization(format!("initializer '{name}' has misaligned external data"));
    let from_shape =
        |err: ndarray::ShapeError| Error::Serialization(format!("initializer '{name}': {err}"));

    match dtype {
        DataType::F32 => {
            let values: &[f32] = bytemuck::try_cast_slice(bytes).map_err(bad_cast)?;
            Ok(TensorData::F32(
                ArrayD::from_shape_vec(shape, values.to_vec()).map_err(from_shape)?,
            ))
        }
        DataType::F16 => {
            let bits: &[u16] = bytemuck::try_cast_slice(bytes).map_err(bad_cast)?;
            Ok(TensorData::F16(
                ArrayD::from_shape_vec(shape, bits.iter().map(|&b| f16::from_bits(b)).collect())
                    .map_err(from_shape)?,
            ))
        }
        DataType::I8 => {
            let values: &[i8] = bytemuck::try_cast_slice(bytes).map_err(bad_cast)?;
            Ok(TensorData::I8(
                ArrayD::from_shape_vec(shape, values.to_vec()).map_err(from_shape)?,
            ))
        }
        DataType::I64 => {
            let values: &[i64] = bytemuck::try_cast_slice(bytes).map_err(bad_cast)?;
            Ok(TensorData::I64(
                ArrayD::from_shape_vec(shape, values.to_vec()).map_err(from_shape)?,
            ))
        }
        other => Err(Error::Serialization(format!(
            "initializer '{name}' has unsupported external dtype {}",
            other.as_str()
        ))),
    }
}
