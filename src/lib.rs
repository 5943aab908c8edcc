//! # Afinar: Post-Training Model Optimization
//!
//! Afinar quantizes ONNX-style compute graphs for efficient
//! deployment. The core is INT4 weight-only quantization (WoQ):
//! block-wise RTN and activation-aware AWQ calibration over the
//! graph's GEMM/MatMul weights, plus the graph pattern matching and
//! QDQ surgery that locate and rewrite quantizable regions.
//!
//! ## Architecture
//!
//! - **graph**: owned node/tensor graph with pattern matching,
//!   ancestor traversal and QDQ insertion/removal
//! - **ops**: operator-category classification
//! - **analyze**: quantizable weights, MHA partitions, residual adds,
//!   exclusion lists
//! - **quant**: block quantization engine with rtn / awq_clip /
//!   awq_lite calibration
//! - **io**: graph-file save/load (JSON + raw external weight data)
//! - **cli**: the `afinar` command-line tool

pub mod analyze;
pub mod cli;
pub mod graph;
pub mod io;
pub mod ops;
pub mod quant;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use graph::{DataType, Graph, Node, NodeId, Tensor, TensorData, TensorId};
pub use quant::{quantize, CalibrationMethod, QuantizeConfig};
