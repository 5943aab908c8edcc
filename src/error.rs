//! Error types for Afinar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported calibration method: '{0}'")]
    UnsupportedCalibration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Graph contains a cycle involving node '{0}'")]
    GraphCycle(String),

    #[error("Tensor not found: {0}")]
    MissingTensor(String),

    #[error("Node not found: {0}")]
    MissingNode(String),

    #[error("Numeric error: {0}")]
    Numeric(String),

    #[error("Unsupported operator for inference: {0}")]
    UnsupportedOp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
