//! Inference-session collaborator
//!
//! Calibration needs to run the target graph and read intermediate
//! activations. The engine is a black box behind two traits: a
//! session answers "given a feed and a list of output names, return
//! those arrays", and a factory builds sessions from a serialized
//! model on disk.
//!
//! `ReferenceSession` is the built-in CPU evaluator covering the
//! fusible operator subset that appears around quantizable regions.
//! It exists so the pipelines and tests run hermetically; production
//! callers plug in a real runtime behind the same traits.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{ArrayD, Axis, Ix2, IxDyn};

use crate::graph::{Graph, NodeId, TensorId};
use crate::io;
use crate::quant::calib::Feed;
use crate::{Error, Result};

/// Synchronous inference over one feed
pub trait InferenceSession {
    /// Compute the named outputs for the given feed
    fn run(&mut self, output_names: &[String], feed: &Feed) -> Result<Vec<ArrayD<f32>>>;
}

/// Builds inference sessions from a model file
pub trait SessionFactory {
    fn create(&self, model_path: &Path) -> Result<Box<dyn InferenceSession>>;
}

/// Factory for the built-in evaluator
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceSessionFactory {
    pub use_external_data_format: bool,
}

impl SessionFactory for ReferenceSessionFactory {
    fn create(&self, model_path: &Path) -> Result<Box<dyn InferenceSession>> {
        let graph = io::load_graph(model_path, self.use_external_data_format)?;
        Ok(Box::new(ReferenceSession::new(graph)?))
    }
}

/// Topological evaluator over the fusible op subset
pub struct ReferenceSession {
    graph: Graph,
    topo: Vec<NodeId>,
}

impl ReferenceSession {
    pub fn new(graph: Graph) -> Result<Self> {
        let topo = graph.toposort()?;
        Ok(Self { graph, topo })
    }

    fn tensor_value(
        &self,
        id: TensorId,
        values: &HashMap<TensorId, ArrayD<f32>>,
    ) -> Result<ArrayD<f32>> {
        if let Some(v) = values.get(&id) {
            return Ok(v.clone());
        }
        let tensor = self.graph.tensor(id);
        tensor
            .data()
            .map(|d| d.to_f32())
            .ok_or_else(|| Error::MissingTensor(tensor.name.clone()))
    }

    fn eval_node(
        &self,
        node: NodeId,
        values: &mut HashMap<TensorId, ArrayD<f32>>,
    ) -> Result<()> {
        let n = self.graph.node(node);
        let input = |slot: usize| -> Result<ArrayD<f32>> {
            let &id = n.inputs.get(slot).ok_or_else(|| {
                Error::Graph(format!("node '{}' missing input {slot}", n.name))
            })?;
            self.tensor_value(id, values)
        };

        let out = match n.op.as_str() {
            "MatMul" => matmul(&input(0)?, &input(1)?)?,
            "Gemm" => {
                let mut a = input(0)?
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| Error::Numeric(format!("Gemm input A: {e}")))?;
                let mut b = input(1)?
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| Error::Numeric(format!("Gemm input B: {e}")))?;
                if n.attr_int("transA").unwrap_or(0) != 0 {
                    a = a.reversed_axes().to_owned();
                }
                if n.attr_int("transB").unwrap_or(0) != 0 {
                    b = b.reversed_axes().to_owned();
                }
                let mut y = a.dot(&b).into_dyn();
                if n.inputs.len() > 2 {
                    y = broadcast_binary(&y, &input(2)?, |x, c| x + c)?;
                }
                y
            }
            "Add" => broadcast_binary(&input(0)?, &input(1)?, |a, b| a + b)?,
            "Sub" => broadcast_binary(&input(0)?, &input(1)?, |a, b| a - b)?,
            "Mul" => broadcast_binary(&input(0)?, &input(1)?, |a, b| a * b)?,
            "Div" => broadcast_binary(&input(0)?, &input(1)?, |a, b| a / b)?,
            "Pow" => broadcast_binary(&input(0)?, &input(1)?, f32::powf)?,
            "Relu" => input(0)?.mapv(|v| v.max(0.0)),
            "Sigmoid" => input(0)?.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            "Tanh" => input(0)?.mapv(f32::tanh),
            "Exp" => input(0)?.mapv(f32::exp),
            "Sqrt" => input(0)?.mapv(f32::sqrt),
            "Neg" => input(0)?.mapv(|v| -v),
            "Softmax" => {
                let x = input(0)?;
                let axis = resolve_axis(n.attr_int("axis").unwrap_or(-1), x.ndim());
                softmax(&x, axis)
            }
            "Transpose" => {
                let x = input(0)?;
                let perm: Vec<usize> = match n.attrs.get("perm").and_then(|a| a.as_ints()) {
                    Some(p) => p.iter().map(|&v| v as usize).collect(),
                    None => (0..x.ndim()).rev().collect(),
                };
                x.permuted_axes(IxDyn(&perm)).to_owned()
            }
            "Reshape" => {
                let x = input(0)?;
                let spec = input(1)?;
                let spec: Vec<i64> = spec.iter().map(|&v| v as i64).collect();
                reshape(&x, &spec)?
            }
            "Flatten" => {
                let x = input(0)?;
                let axis = resolve_axis(n.attr_int("axis").unwrap_or(1), x.ndim());
                let lead: usize = x.shape()[..axis].iter().product();
                let tail: usize = x.shape()[axis..].iter().product();
                x.to_shape(IxDyn(&[lead.max(1), tail.max(1)]))
                    .map_err(|e| Error::Numeric(format!("Flatten: {e}")))?
                    .to_owned()
            }
            "Identity" | "Cast" => input(0)?,
            "Squeeze" => {
                let x = input(0)?;
                let shape: Vec<usize> = x.shape().iter().copied().filter(|&d| d != 1).collect();
                x.to_shape(IxDyn(&shape))
                    .map_err(|e| Error::Numeric(format!("Squeeze: {e}")))?
                    .to_owned()
            }
            "Unsqueeze" => {
                let x = input(0)?;
                let mut shape: Vec<usize> = x.shape().to_vec();
                shape.insert(0, 1);
                x.to_shape(IxDyn(&shape))
                    .map_err(|e| Error::Numeric(format!("Unsqueeze: {e}")))?
                    .to_owned()
            }
            other => return Err(Error::UnsupportedOp(other.to_string())),
        };

        if let Some(&out_id) = n.outputs.first() {
            values.insert(out_id, out);
        }
        Ok(())
    }
}

impl InferenceSession for ReferenceSession {
    fn run(&mut self, output_names: &[String], feed: &Feed) -> Result<Vec<ArrayD<f32>>> {
        let mut values: HashMap<TensorId, ArrayD<f32>> = HashMap::new();
        for (name, data) in feed {
            if let Some(id) = self.graph.tensor_id(name) {
                values.insert(id, data.to_f32());
            }
        }

        for &node in &self.topo {
            self.eval_node(node, &mut values)?;
        }

        output_names
            .iter()
            .map(|name| {
                let id = self
                    .graph
                    .tensor_id(name)
                    .ok_or_else(|| Error::MissingTensor(name.clone()))?;
                self.tensor_value(id, &values)
            })
            .collect()
    }
}

fn resolve_axis(axis: i64, ndim: usize) -> usize {
    if axis < 0 {
        (ndim as i64 + axis) as usize
    } else {
        axis as usize
    }
}

/// 2-D or batched matmul. Batched inputs must share leading dims, or
/// the right side must be rank 2 (the weight case).
fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if a.ndim() == 2 && b.ndim() == 2 {
        let a2 = a.view().into_dimensionality::<Ix2>().unwrap();
        let b2 = b.view().into_dimensionality::<Ix2>().unwrap();
        return Ok(a2.dot(&b2).into_dyn());
    }

    if b.ndim() == 2 {
        // [.., K] @ [K, N]: flatten leading dims
        let k = *a.shape().last().ok_or_else(|| Error::Numeric("matmul on scalar".into()))?;
        let rows: usize = a.len() / k;
        let a2 = a
            .to_shape((rows, k))
            .map_err(|e| Error::Numeric(format!("matmul reshape: {e}")))?
            .to_owned();
        let b2 = b.view().into_dimensionality::<Ix2>().unwrap();
        let y = a2.dot(&b2);
        let mut shape: Vec<usize> = a.shape()[..a.ndim() - 1].to_vec();
        shape.push(b.shape()[1]);
        return Ok(y
            .to_shape(IxDyn(&shape))
            .map_err(|e| Error::Numeric(format!("matmul reshape: {e}")))?
            .to_owned());
    }

    if a.ndim() == b.ndim() && a.shape()[..a.ndim() - 2] == b.shape()[..b.ndim() - 2] {
        let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
        let (k2, nn) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
        if k != k2 {
            return Err(Error::ShapeMismatch {
                expected: a.shape().to_vec(),
                got: b.shape().to_vec(),
            });
        }
        let batch: usize = a.shape()[..a.ndim() - 2].iter().product();
        let a3 = a
            .to_shape((batch, m, k))
            .map_err(|e| Error::Numeric(format!("matmul reshape: {e}")))?
            .to_owned();
        let b3 = b
            .to_shape((batch, k, nn))
            .map_err(|e| Error::Numeric(format!("matmul reshape: {e}")))?
            .to_owned();
        let mut out = ndarray::Array3::<f32>::zeros((batch, m, nn));
        for idx in 0..batch {
            let y = a3.index_axis(Axis(0), idx).dot(&b3.index_axis(Axis(0), idx));
            out.index_axis_mut(Axis(0), idx).assign(&y);
        }
        let mut shape: Vec<usize> = a.shape()[..a.ndim() - 2].to_vec();
        shape.push(m);
        shape.push(nn);
        return Ok(out
            .to_shape(IxDyn(&shape))
            .map_err(|e| Error::Numeric(format!("matmul reshape: {e}")))?
            .to_owned());
    }

    Err(Error::ShapeMismatch {
        expected: a.shape().to_vec(),
        got: b.shape().to_vec(),
    })
}

/// Numpy-style right-aligned broadcast of a binary op
fn broadcast_binary(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>> {
    let ndim = a.ndim().max(b.ndim());
    let mut shape = vec![1usize; ndim];
    for (i, dim) in shape.iter_mut().enumerate() {
        let da = a.shape().get(a.ndim().wrapping_sub(ndim - i)).copied().unwrap_or(1);
        let db = b.shape().get(b.ndim().wrapping_sub(ndim - i)).copied().unwrap_or(1);
        if da != db && da != 1 && db != 1 {
            return Err(Error::ShapeMismatch {
                expected: a.shape().to_vec(),
                got: b.shape().to_vec(),
            });
        }
        *dim = da.max(db);
    }
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| Error::ShapeMismatch {
            expected: shape.clone(),
            got: a.shape().to_vec(),
        })?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| Error::ShapeMismatch {
            expected: shape.clone(),
            got: b.shape().to_vec(),
        })?;
    let mut out = av.to_owned();
    out.zip_mut_with(&bv, |x, &y| *x = f(*x, y));
    Ok(out)
}

fn softmax(x: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }
    out
}

fn reshape(x: &ArrayD<f32>, spec: &[i64]) -> Result<ArrayD<f32>> {
    let mut shape: Vec<usize> = Vec::with_capacity(spec.len());
    let mut infer: Option<usize> = None;
    for (i, &d) in spec.iter().enumerate() {
        match d {
            0 => shape.push(*x.shape().get(i).ok_or_else(|| {
                Error::Numeric("reshape dim 0 out of range".into())
            })?),
            -1 => {
                if infer.is_some() {
                    return Err(Error::Numeric("reshape with multiple -1 dims".into()));
                }
                infer = Some(i);
                shape.push(1);
            }
            d if d > 0 => shape.push(d as usize),
            _ => return Err(Error::Numeric(format!("invalid reshape dim {d}"))),
        }
    }
    if let Some(i) = infer {
        let known: usize = shape.iter().product();
        shape[i] = x.len() / known.max(1);
    }
    x.to_shape(IxDyn(&shape))
        .map_err(|e| Error::Numeric(format!("reshape: {e}")))
        .map(|v| v.to_owned())
}
