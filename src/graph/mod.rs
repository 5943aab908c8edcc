//! Owned computation-graph model
//!
//! The graph owns arenas of nodes and tensors addressed by integer
//! handles (`NodeId`/`TensorId`) plus a name index. All structural
//! edits go through `Graph` methods so that producer/consumer edge
//! maps stay consistent and the graph stays topologically sortable.
//!
//! - **Constant** tensors own a numeric array (weights, scales)
//! - **Variable** tensors carry dtype/shape only and are produced by
//!   exactly one node, or are external graph inputs
//!
//! Mutating passes finish with `cleanup()` + `toposort()`; `cleanup`
//! compacts the arenas, so handles must be re-resolved by name after
//! it runs.

pub mod pattern;
pub mod qdq;
pub mod traverse;

use std::collections::{BTreeMap, HashMap, HashSet};

use half::f16;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Handle of a node in the graph arena
pub type NodeId = usize;

/// Handle of a tensor in the graph arena
pub type TensorId = usize;

/// Element type of a tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DataType {
    #[default]
    F32,
    F16,
    I8,
    I32,
    I64,
    Bool,
}

impl DataType {
    /// Short lowercase name, as stored in the graph file
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Bool => "bool",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "f32" => Ok(DataType::F32),
            "f16" => Ok(DataType::F16),
            "i8" => Ok(DataType::I8),
            "i32" => Ok(DataType::I32),
            "i64" => Ok(DataType::I64),
            "bool" => Ok(DataType::Bool),
            other => Err(Error::Serialization(format!("unknown dtype '{other}'"))),
        }
    }

    /// Whether this is a floating-point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F16)
    }
}

/// Owned payload of a constant tensor
#[derive(Clone, Debug)]
pub enum TensorData {
    F32(ArrayD<f32>),
    F16(ArrayD<f16>),
    I8(ArrayD<i8>),
    I64(ArrayD<i64>),
}

impl TensorData {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::F16(_) => DataType::F16,
            TensorData::I8(_) => DataType::I8,
            TensorData::I64(_) => DataType::I64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::F32(a) => a.shape(),
            TensorData::F16(a) => a.shape(),
            TensorData::I8(a) => a.shape(),
            TensorData::I64(a) => a.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upcast to f32 for internal computation. Integer payloads are
    /// widened; f16 is promoted losslessly.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            TensorData::F32(a) => a.clone(),
            TensorData::F16(a) => a.mapv(f16::to_f32),
            TensorData::I8(a) => a.mapv(|v| v as f32),
            TensorData::I64(a) => a.mapv(|v| v as f32),
        }
    }

    /// Downcast an f32 array into the requested float container.
    /// Only float targets make sense here; integer targets are a
    /// caller bug and reported as a numeric error.
    pub fn from_f32(array: ArrayD<f32>, dtype: DataType) -> Result<Self> {
        match dtype {
            DataType::F32 => Ok(TensorData::F32(array)),
            DataType::F16 => Ok(TensorData::F16(array.mapv(f16::from_f32))),
            other => Err(Error::Numeric(format!(
                "cannot store f32 data as {}",
                other.as_str()
            ))),
        }
    }
}

/// A tensor is either a constant (owns data) or a variable
/// (shape/dtype only, value produced at runtime)
#[derive(Clone, Debug)]
pub enum TensorKind {
    Constant(TensorData),
    Variable {
        dtype: DataType,
        shape: Option<Vec<i64>>,
    },
}

#[derive(Clone, Debug)]
pub struct Tensor {
    pub name: String,
    pub kind: TensorKind,
}

impl Tensor {
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, TensorKind::Constant(_))
    }

    /// Constant payload, if any
    pub fn data(&self) -> Option<&TensorData> {
        match &self.kind {
            TensorKind::Constant(d) => Some(d),
            TensorKind::Variable { .. } => None,
        }
    }

    pub fn dtype(&self) -> DataType {
        match &self.kind {
            TensorKind::Constant(d) => d.dtype(),
            TensorKind::Variable { dtype, .. } => *dtype,
        }
    }
}

/// Node attribute value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Str(String),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::Ints(v) => Some(v),
            _ => None,
        }
    }
}

/// Operator node: op type tag, name, ordered input/output tensors,
/// attribute map
#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub op: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn attr_int(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(AttrValue::as_int)
    }
}

/// Mutable DAG of nodes and tensors
#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Node>,
    tensors: Vec<Tensor>,
    tensor_ids: HashMap<String, TensorId>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    producers: Vec<Option<NodeId>>,
    consumers: Vec<Vec<NodeId>>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Tensors

    /// Register a variable tensor. Duplicate names are an error: tensor
    /// names are the stable addressing scheme across mutations.
    pub fn add_variable(
        &mut self,
        name: impl Into<String>,
        dtype: DataType,
        shape: Option<Vec<i64>>,
    ) -> Result<TensorId> {
        self.add_tensor(Tensor {
            name: name.into(),
            kind: TensorKind::Variable { dtype, shape },
        })
    }

    /// Register a constant tensor (initializer)
    pub fn add_constant(&mut self, name: impl Into<String>, data: TensorData) -> Result<TensorId> {
        self.add_tensor(Tensor {
            name: name.into(),
            kind: TensorKind::Constant(data),
        })
    }

    fn add_tensor(&mut self, tensor: Tensor) -> Result<TensorId> {
        if self.tensor_ids.contains_key(&tensor.name) {
            return Err(Error::Graph(format!("duplicate tensor name '{}'", tensor.name)));
        }
        let id = self.tensors.len();
        self.tensor_ids.insert(tensor.name.clone(), id);
        self.tensors.push(tensor);
        self.producers.push(None);
        self.consumers.push(Vec::new());
        Ok(id)
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn tensor_id(&self, name: &str) -> Option<TensorId> {
        self.tensor_ids.get(name).copied()
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor_entries(&self) -> impl Iterator<Item = (TensorId, &Tensor)> {
        self.tensors.iter().enumerate()
    }

    /// Retype a variable tensor in place. Constants keep their payload
    /// dtype; retyping one is a caller mistake worth surfacing softly.
    pub fn set_tensor_dtype(&mut self, name: &str, dtype: DataType) -> Result<()> {
        let id = self
            .tensor_id(name)
            .ok_or_else(|| Error::MissingTensor(name.to_string()))?;
        match &mut self.tensors[id].kind {
            TensorKind::Variable { dtype: d, .. } => {
                *d = dtype;
                Ok(())
            }
            TensorKind::Constant(_) => {
                tracing::warn!(tensor = name, "set_tensor_dtype on constant ignored");
                Ok(())
            }
        }
    }

    /// Turn a constant into a produced variable with the same name,
    /// keeping consumers wired. Used when a Dequantize node takes over
    /// production of a former initializer.
    pub fn convert_to_variable(&mut self, id: TensorId) -> Result<()> {
        let tensor = &mut self.tensors[id];
        match &tensor.kind {
            TensorKind::Constant(data) => {
                let dtype = data.dtype();
                let shape = data.shape().iter().map(|&d| d as i64).collect();
                tensor.kind = TensorKind::Variable {
                    dtype,
                    shape: Some(shape),
                };
                Ok(())
            }
            TensorKind::Variable { .. } => Err(Error::Graph(format!(
                "tensor '{}' is already a variable",
                tensor.name
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Nodes

    /// Add a node. Enforces the single-producer invariant: each output
    /// tensor must not already have a producer.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: impl Into<String>,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        attrs: BTreeMap<String, AttrValue>,
    ) -> Result<NodeId> {
        let name = name.into();
        for &out in &outputs {
            if self.producers[out].is_some() {
                return Err(Error::Graph(format!(
                    "tensor '{}' already has a producer (adding node '{name}')",
                    self.tensors[out].name
                )));
            }
            if self.tensors[out].is_constant() {
                return Err(Error::Graph(format!(
                    "node '{name}' cannot produce constant tensor '{}'",
                    self.tensors[out].name
                )));
            }
        }
        let id = self.nodes.len();
        for &out in &outputs {
            self.producers[out] = Some(id);
        }
        for &inp in &inputs {
            self.consumers[inp].push(id);
        }
        self.nodes.push(Node {
            name,
            op: op.into(),
            inputs,
            outputs,
            attrs,
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_entries(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Rewire one input slot of a node to a different tensor
    pub fn set_node_input(&mut self, node: NodeId, slot: usize, tensor: TensorId) -> Result<()> {
        let old = *self.nodes[node]
            .inputs
            .get(slot)
            .ok_or_else(|| Error::Graph(format!("node '{}' has no input {slot}", self.nodes[node].name)))?;
        self.nodes[node].inputs[slot] = tensor;
        if let Some(pos) = self.consumers[old].iter().position(|&n| n == node) {
            self.consumers[old].remove(pos);
        }
        self.consumers[tensor].push(node);
        Ok(())
    }

    /// Move one output slot of a node to a different tensor. The new
    /// tensor must be producer-free; the old tensor becomes unproduced.
    pub fn set_node_output(&mut self, node: NodeId, slot: usize, tensor: TensorId) -> Result<()> {
        if self.producers[tensor].is_some() {
            return Err(Error::Graph(format!(
                "tensor '{}' already has a producer",
                self.tensors[tensor].name
            )));
        }
        let old = *self.nodes[node]
            .outputs
            .get(slot)
            .ok_or_else(|| Error::Graph(format!("node '{}' has no output {slot}", self.nodes[node].name)))?;
        self.nodes[node].outputs[slot] = tensor;
        self.producers[old] = None;
        self.producers[tensor] = Some(node);
        Ok(())
    }

    /// Point every consumer of `from` (except the listed nodes) at `to`
    pub fn rewire_consumers(&mut self, from: TensorId, to: TensorId, except: &[NodeId]) {
        let readers: Vec<NodeId> = self.consumers[from]
            .iter()
            .copied()
            .filter(|n| !except.contains(n))
            .collect();
        for node in readers {
            for slot in 0..self.nodes[node].inputs.len() {
                if self.nodes[node].inputs[slot] == from {
                    self.nodes[node].inputs[slot] = to;
                    self.consumers[to].push(node);
                }
            }
            self.consumers[from].retain(|&n| n != node);
        }
    }

    // ------------------------------------------------------------------
    // Edges

    pub fn producer(&self, tensor: TensorId) -> Option<NodeId> {
        self.producers[tensor]
    }

    pub fn consumers(&self, tensor: TensorId) -> &[NodeId] {
        &self.consumers[tensor]
    }

    /// Producer nodes of this node's inputs, deduplicated in input order
    pub fn parents(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &inp in &self.nodes[node].inputs {
            if let Some(p) = self.producers[inp] {
                if seen.insert(p) {
                    out.push(p);
                }
            }
        }
        out
    }

    /// Consumer nodes of this node's outputs, deduplicated in output order
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &outp in &self.nodes[node].outputs {
            for &c in &self.consumers[outp] {
                if seen.insert(c) {
                    out.push(c);
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Graph-level inputs/outputs

    pub fn set_inputs(&mut self, inputs: Vec<TensorId>) {
        self.inputs = inputs;
    }

    pub fn set_outputs(&mut self, outputs: Vec<TensorId>) {
        self.outputs = outputs;
    }

    /// Append a graph output if not already present
    pub fn add_output(&mut self, tensor: TensorId) {
        if !self.outputs.contains(&tensor) {
            self.outputs.push(tensor);
        }
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    // ------------------------------------------------------------------
    // Ordering and cleanup

    /// Kahn topological sort over all live nodes. Returns node ids in
    /// executable order, or a cycle error naming an offending node.
    pub fn toposort(&self) -> Result<Vec<NodeId>> {
        let mut indegree: Vec<usize> = vec![0; self.nodes.len()];
        for (id, _) in self.node_entries() {
            indegree[id] = self.parents(id).len();
        }
        let mut ready: Vec<NodeId> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for child in self.children(id) {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.push(child);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = indegree
                .iter()
                .position(|&d| d > 0)
                .map(|i| self.nodes[i].name.clone())
                .unwrap_or_default();
            return Err(Error::GraphCycle(stuck));
        }
        Ok(order)
    }

    /// Drop nodes not reachable backward from the graph outputs, and
    /// tensors no longer referenced by any live node or graph I/O.
    /// Compacts the arenas: existing `NodeId`/`TensorId` handles are
    /// invalidated and must be re-resolved by name.
    pub fn cleanup(&mut self) {
        let mut live_nodes = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self
            .outputs
            .iter()
            .filter_map(|&t| self.producers[t])
            .collect();
        while let Some(id) = stack.pop() {
            if live_nodes[id] {
                continue;
            }
            live_nodes[id] = true;
            stack.extend(self.parents(id));
        }

        let mut live_tensors = vec![false; self.tensors.len()];
        for &t in self.inputs.iter().chain(self.outputs.iter()) {
            live_tensors[t] = true;
        }
        for (id, node) in self.node_entries() {
            if live_nodes[id] {
                for &t in node.inputs.iter().chain(node.outputs.iter()) {
                    live_tensors[t] = true;
                }
            }
        }

        let mut tensor_remap: Vec<Option<TensorId>> = vec![None; self.tensors.len()];
        let mut tensors = Vec::new();
        let mut tensor_ids = HashMap::new();
        for (old, tensor) in self.tensors.drain(..).enumerate() {
            if live_tensors[old] {
                let new = tensors.len();
                tensor_remap[old] = Some(new);
                tensor_ids.insert(tensor.name.clone(), new);
                tensors.push(tensor);
            }
        }

        let mut nodes = Vec::new();
        for (old, mut node) in self.nodes.drain(..).enumerate() {
            if live_nodes[old] {
                for t in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                    *t = tensor_remap[*t].expect("live node references live tensor");
                }
                nodes.push(node);
            }
        }

        self.nodes = nodes;
        self.tensors = tensors;
        self.tensor_ids = tensor_ids;
        self.inputs = self
            .inputs
            .iter()
            .filter_map(|&t| tensor_remap[t])
            .collect();
        self.outputs = self
            .outputs
            .iter()
            .filter_map(|&t| tensor_remap[t])
            .collect();
        self.rebuild_edges();
    }

    fn rebuild_edges(&mut self) {
        self.producers = vec![None; self.tensors.len()];
        self.consumers = vec![Vec::new(); self.tensors.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            for &out in &node.outputs {
                self.producers[out] = Some(id);
            }
            for &inp in &node.inputs {
                self.consumers[inp].push(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn constant(graph: &mut Graph, name: &str, values: Vec<f32>, shape: &[usize]) -> TensorId {
        let data = ArrayD::from_shape_vec(ndarray::IxDyn(shape), values).unwrap();
        graph.add_constant(name, TensorData::F32(data)).unwrap()
    }

    #[test]
    fn test_add_node_and_edges() {
        let mut g = Graph::new("test");
        let x = g.add_variable("x", DataType::F32, Some(vec![1, 4])).unwrap();
        let w = constant(&mut g, "w", vec![0.0; 8], &[4, 2]);
        let y = g.add_variable("y", DataType::F32, None).unwrap();
        let mm = g
            .add_node("mm", "MatMul", vec![x, w], vec![y], BTreeMap::new())
            .unwrap();

        assert_eq!(g.producer(y), Some(mm));
        assert_eq!(g.consumers(x), &[mm]);
        assert_eq!(g.consumers(w), &[mm]);
        assert!(g.parents(mm).is_empty());
    }

    #[test]
    fn test_single_producer_invariant() {
        let mut g = Graph::new("test");
        let x = g.add_variable("x", DataType::F32, None).unwrap();
        let y = g.add_variable("y", DataType::F32, None).unwrap();
        g.add_node("a", "Relu", vec![x], vec![y], BTreeMap::new())
            .unwrap();
        let err = g.add_node("b", "Relu", vec![x], vec![y], BTreeMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_duplicate_tensor_name_rejected() {
        let mut g = Graph::new("test");
        g.add_variable("x", DataType::F32, None).unwrap();
        assert!(g.add_variable("x", DataType::F32, None).is_err());
    }

    #[test]
    fn test_toposort_chain() {
        let mut g = Graph::new("test");
        let x = g.add_variable("x", DataType::F32, None).unwrap();
        let h = g.add_variable("h", DataType::F32, None).unwrap();
        let y = g.add_variable("y", DataType::F32, None).unwrap();
        // Insert in reverse order to make the sort do real work
        let n2 = g
            .add_node("n2", "Softmax", vec![h], vec![y], BTreeMap::new())
            .unwrap();
        let n1 = g
            .add_node("n1", "Relu", vec![x], vec![h], BTreeMap::new())
            .unwrap();

        let order = g.toposort().unwrap();
        let pos1 = order.iter().position(|&n| n == n1).unwrap();
        let pos2 = order.iter().position(|&n| n == n2).unwrap();
        assert!(pos1 < pos2);
    }

    #[test]
    fn test_cleanup_drops_unreachable() {
        let mut g = Graph::new("test");
        let x = g.add_variable("x", DataType::F32, None).unwrap();
        let y = g.add_variable("y", DataType::F32, None).unwrap();
        let dead = g.add_variable("dead", DataType::F32, None).unwrap();
        g.add_node("keep", "Relu", vec![x], vec![y], BTreeMap::new())
            .unwrap();
        g.add_node("drop", "Relu", vec![x], vec![dead], BTreeMap::new())
            .unwrap();
        g.set_inputs(vec![x]);
        g.set_outputs(vec![y]);

        g.cleanup();

        assert_eq!(g.num_nodes(), 1);
        assert!(g.node_id("keep").is_some());
        assert!(g.node_id("drop").is_none());
        assert!(g.tensor_id("dead").is_none());
        g.toposort().unwrap();
    }

    #[test]
    fn test_rewire_consumers() {
        let mut g = Graph::new("test");
        let a = g.add_variable("a", DataType::F32, None).unwrap();
        let b = g.add_variable("b", DataType::F32, None).unwrap();
        let o1 = g.add_variable("o1", DataType::F32, None).unwrap();
        let o2 = g.add_variable("o2", DataType::F32, None).unwrap();
        let r1 = g
            .add_node("r1", "Relu", vec![a], vec![o1], BTreeMap::new())
            .unwrap();
        let r2 = g
            .add_node("r2", "Relu", vec![a], vec![o2], BTreeMap::new())
            .unwrap();

        g.rewire_consumers(a, b, &[r1]);

        assert_eq!(g.node(r1).inputs, vec![a]);
        assert_eq!(g.node(r2).inputs, vec![b]);
        assert_eq!(g.consumers(a), &[r1]);
        assert_eq!(g.consumers(b), &[r2]);
    }

    #[test]
    fn test_convert_to_variable() {
        let mut g = Graph::new("test");
        let w = constant(&mut g, "w", vec![1.0, 2.0], &[2]);
        g.convert_to_variable(w).unwrap();
        assert!(!g.tensor(w).is_constant());
        assert_eq!(g.tensor(w).dtype(), DataType::F32);
        // Now a node may take over production
        g.add_node("dq", "DequantizeLinear", vec![], vec![w], BTreeMap::new())
            .unwrap();
    }
}
