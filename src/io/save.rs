//! Graph saving

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use half::f16;
use ndarray::ArrayD;

use super::format::{
    AttrDef, GraphDef, GraphFile, InitializerDef, NodeDef, TensorPayload, ValueDef, IR_VERSION,
};
use super::external_data_path;
use crate::graph::{AttrValue, Graph, TensorData, TensorKind};
use crate::{Error, Result};

/// Serialize a graph to `path`. With `use_external_data_format`, the
/// constant payloads land in a raw little-endian side file next to
/// the model and the JSON carries offset/length references.
pub fn save_graph(graph: &Graph, path: impl AsRef<Path>, use_external_data_format: bool) -> Result<()> {
    let path = path.as_ref();
    let order = graph.toposort()?;

    let mut values = Vec::new();
    let mut initializers = Vec::new();
    let mut external = ExternalWriter::new();

    for (_, tensor) in graph.tensor_entries() {
        match &tensor.kind {
            TensorKind::Variable { dtype, shape } => values.push(ValueDef {
                name: tensor.name.clone(),
                dtype: dtype.as_str().to_string(),
                shape: shape.clone(),
            }),
            TensorKind::Constant(data) => {
                let payload = if use_external_data_format {
                    external.append(data)?
                } else {
                    inline_payload(data)?
                };
                initializers.push(InitializerDef {
                    name: tensor.name.clone(),
                    dtype: data.dtype().as_str().to_string(),
                    shape: data.shape().to_vec(),
                    payload,
                });
            }
        }
    }

    let nodes = order
        .iter()
        .map(|&id| {
            let node = graph.node(id);
            NodeDef {
                name: node.name.clone(),
                op: node.op.clone(),
                inputs: node
                    .inputs
                    .iter()
                    .map(|&t| graph.tensor(t).name.clone())
                    .collect(),
                outputs: node
                    .outputs
                    .iter()
                    .map(|&t| graph.tensor(t).name.clone())
                    .collect(),
                attrs: node
                    .attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), attr_def(v)))
                    .collect::<BTreeMap<_, _>>(),
            }
        })
        .collect();

    let file = GraphFile {
        ir_version: IR_VERSION,
        producer: "afinar".to_string(),
        graph: GraphDef {
            name: graph.name.clone(),
            inputs: graph
                .inputs()
                .iter()
                .map(|&t| graph.tensor(t).name.clone())
                .collect(),
            outputs: graph
                .outputs()
                .iter()
                .map(|&t| graph.tensor(t).name.clone())
                .collect(),
            values,
            initializers,
            nodes,
        },
    };

    let json = serde_json::to_string(&file)
        .map_err(|e| Error::Serialization(format!("graph serialization failed: {e}")))?;
    File::create(path)?.write_all(json.as_bytes())?;

    if use_external_data_format {
        File::create(external_data_path(path))?.write_all(&external.bytes)?;
    }
    Ok(())
}

fn attr_def(value: &AttrValue) -> AttrDef {
    match value {
        AttrValue::Int(v) => AttrDef::Int(*v),
        AttrValue::Float(v) => AttrDef::Float(*v),
        AttrValue::Ints(v) => AttrDef::Ints(v.clone()),
        AttrValue::Str(v) => AttrDef::Str(v.clone()),
    }
}

fn contiguous<T: Clone>(array: &ArrayD<T>) -> Vec<T> {
    array.iter().cloned().collect()
}

fn inline_payload(data: &TensorData) -> Result<TensorPayload> {
    Ok(match data {
        TensorData::F32(a) => TensorPayload::F32 {
            values: contiguous(a),
        },
        TensorData::F16(a) => TensorPayload::F16 {
            bits: a.iter().map(|v| v.to_bits()).collect(),
        },
        TensorData::I8(a) => TensorPayload::I8 {
            values: contiguous(a),
        },
        TensorData::I64(a) => TensorPayload::I64 {
            values: contiguous(a),
        },
    })
}

struct ExternalWriter {
    bytes: Vec<u8>,
}

impl ExternalWriter {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn append(&mut self, data: &TensorData) -> Result<TensorPayload> {
        let offset = self.bytes.len() as u64;
        match data {
            TensorData::F32(a) => self
                .bytes
                .extend_from_slice(bytemuck::cast_slice(&contiguous(a))),
            TensorData::F16(a) => {
                let bits: Vec<u16> = a.iter().map(|x| f16::to_bits(*x)).collect();
                self.bytes.extend_from_slice(bytemuck::cast_slice(&bits));
            }
            TensorData::I8(a) => self
                .bytes
                .extend_from_slice(bytemuck::cast_slice(&contiguous(a))),
            TensorData::I64(a) => self
                .bytes
                .extend_from_slice(bytemuck::cast_slice(&contiguous(a))),
        }
        Ok(TensorPayload::External {
            offset,
            length: self.bytes.len() as u64 - offset,
        })
    }
}
