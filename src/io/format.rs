//! Graph file format definitions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Format revision written into every file
pub const IR_VERSION: u32 = 9;

/// Top-level model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphFile {
    pub ir_version: u32,
    pub producer: String,
    pub graph: GraphDef,
}

/// Serialized graph body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDef {
    pub name: String,
    /// Names of external input tensors
    pub inputs: Vec<String>,
    /// Names of graph output tensors
    pub outputs: Vec<String>,
    /// Variable tensors (inputs, outputs and intermediates)
    pub values: Vec<ValueDef>,
    /// Constant tensors with payloads
    pub initializers: Vec<InitializerDef>,
    /// Nodes in topological order
    pub nodes: Vec<NodeDef>,
}

/// A variable tensor: dtype and optional symbolic shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueDef {
    pub name: String,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<i64>>,
}

/// A constant tensor. The payload is either inline or a reference
/// into the raw side file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializerDef {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub payload: TensorPayload,
}

/// Constant payload encodings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TensorPayload {
    F32 { values: Vec<f32> },
    /// f16 stored as raw bit patterns
    F16 { bits: Vec<u16> },
    I8 { values: Vec<i8> },
    I64 { values: Vec<i64> },
    /// Byte range in the external side file
    External { offset: u64, length: u64 },
}

/// Serialized node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrDef>,
}

/// Serialized attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrDef {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Str(String),
}
