//! INT4 weight-only quantization
//!
//! Post-training quantization of graph weights:
//! - **rtn** / **rtn_dq**: data-free round-to-nearest block scales
//! - **awq_clip**: activation-aware per-block range clipping
//! - **awq_lite**: activation-aware closed-form channel scaling
//!
//! The `_trt` method variants emit TensorRT custom-op names for the
//! inserted quantize/dequantize nodes.

pub mod awq_clip;
pub mod awq_lite;
pub mod block;
pub mod calib;
pub mod fake_quantize;
pub mod rtn;
pub mod session;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::graph::qdq::QdqOpNames;
use crate::graph::{DataType, Graph};
use crate::{io, Error, Result};

pub use awq_clip::{clip_alphas, clip_search, quantize_awq_clip, AwqClipHelper};
pub use awq_lite::{get_act_scale, get_scale, get_weight_scale, lite_alphas, quantize_awq_lite, AwqLiteHelper};
pub use block::BLOCK_SIZE;
pub use calib::{CalibrationDataReader, Feed, RandomDataProvider, VecDataReader};
pub use fake_quantize::{fake_tensor_quant, tensor_quant, FakeQuantConfig};
pub use rtn::quantize_rtn;
pub use session::{InferenceSession, ReferenceSession, ReferenceSessionFactory, SessionFactory};

/// Calibration algorithm selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    Rtn,
    RtnDq,
    RtnTrt,
    RtnTrtDq,
    AwqClip,
    AwqClipTrt,
    AwqLite,
}

impl CalibrationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationMethod::Rtn => "rtn",
            CalibrationMethod::RtnDq => "rtn_dq",
            CalibrationMethod::RtnTrt => "rtn_trt",
            CalibrationMethod::RtnTrtDq => "rtn_trt_dq",
            CalibrationMethod::AwqClip => "awq_clip",
            CalibrationMethod::AwqClipTrt => "awq_clip_trt",
            CalibrationMethod::AwqLite => "awq_lite",
        }
    }

    /// Whether the inserted nodes use TensorRT custom-op names
    pub fn is_trt(&self) -> bool {
        matches!(
            self,
            CalibrationMethod::RtnTrt
                | CalibrationMethod::RtnTrtDq
                | CalibrationMethod::AwqClipTrt
        )
    }

    /// Whether RTN bakes quantized weights behind Dequantize-only nodes
    pub fn dq_only(&self) -> bool {
        matches!(self, CalibrationMethod::RtnDq | CalibrationMethod::RtnTrtDq)
    }

    /// Whether the method consumes calibration data
    pub fn requires_calibration_data(&self) -> bool {
        matches!(
            self,
            CalibrationMethod::AwqClip | CalibrationMethod::AwqClipTrt | CalibrationMethod::AwqLite
        )
    }
}

impl FromStr for CalibrationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rtn" => Ok(CalibrationMethod::Rtn),
            "rtn_dq" => Ok(CalibrationMethod::RtnDq),
            "rtn_trt" => Ok(CalibrationMethod::RtnTrt),
            "rtn_trt_dq" => Ok(CalibrationMethod::RtnTrtDq),
            "awq_clip" => Ok(CalibrationMethod::AwqClip),
            "awq_clip_trt" => Ok(CalibrationMethod::AwqClipTrt),
            "awq_lite" => Ok(CalibrationMethod::AwqLite),
            other => Err(Error::UnsupportedCalibration(other.to_string())),
        }
    }
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration surface of the quantization pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuantizeConfig {
    pub calibration_method: CalibrationMethod,
    /// Block size along the input-channel axis
    pub block_size: usize,
    /// Coerce computed scales (and retyped activations) to f16
    pub force_fp16: bool,
    /// Cache all intermediate activations in host memory in one sweep
    pub enable_fast_path_using_high_sysram: bool,
    /// Keep large weights in a raw side file next to the model
    pub use_external_data_format: bool,
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self {
            calibration_method: CalibrationMethod::AwqClip,
            block_size: BLOCK_SIZE,
            force_fp16: false,
            enable_fast_path_using_high_sysram: false,
            use_external_data_format: false,
        }
    }
}

impl QuantizeConfig {
    pub fn qdq_ops(&self) -> QdqOpNames {
        if self.calibration_method.is_trt() {
            QdqOpNames::trt()
        } else {
            QdqOpNames::onnx()
        }
    }
}

/// Apply INT4 weight-only quantization to a model file and return the
/// quantized graph. Currently only GEMM/MatMul quantization is
/// supported.
///
/// Without a calibration data reader, the activation-aware methods
/// fall back to a single random feed synthesized from the graph's
/// input signature.
pub fn quantize(
    model_path: impl AsRef<Path>,
    config: &QuantizeConfig,
    calibration_data_reader: Option<&mut dyn CalibrationDataReader>,
    sessions: &dyn SessionFactory,
) -> Result<Graph> {
    info!(method = %config.calibration_method, "quantization mode: int4");
    let gemm_io_type = if config.force_fp16 {
        DataType::F16
    } else {
        DataType::F32
    };

    let mut graph = io::load_graph(model_path.as_ref(), config.use_external_data_format)?;

    let mut default_reader;
    let reader: &mut dyn CalibrationDataReader = match calibration_data_reader {
        Some(reader) => reader,
        None => {
            default_reader = RandomDataProvider::from_graph(&graph, 1, 0);
            &mut default_reader
        }
    };

    match config.calibration_method {
        CalibrationMethod::Rtn
        | CalibrationMethod::RtnDq
        | CalibrationMethod::RtnTrt
        | CalibrationMethod::RtnTrtDq => {
            quantize_rtn(
                &mut graph,
                gemm_io_type,
                config.calibration_method.dq_only(),
                config.block_size,
                config.qdq_ops(),
            )?;
        }
        CalibrationMethod::AwqClip | CalibrationMethod::AwqClipTrt => {
            quantize_awq_clip(&mut graph, reader, sessions, config)?;
        }
        CalibrationMethod::AwqLite => {
            quantize_awq_lite(&mut graph, reader, sessions, config)?;
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_round_trip() {
        for name in [
            "rtn",
            "rtn_dq",
            "rtn_trt",
            "rtn_trt_dq",
            "awq_clip",
            "awq_clip_trt",
            "awq_lite",
        ] {
            let method: CalibrationMethod = name.parse().unwrap();
            assert_eq!(method.as_str(), name);
        }
    }

    #[test]
    fn test_unsupported_method_errors() {
        let err = "awq_full".parse::<CalibrationMethod>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedCalibration(_)));
        assert!(err.to_string().contains("awq_full"));
    }

    #[test]
    fn test_trt_and_dq_flags() {
        assert!(CalibrationMethod::RtnTrtDq.is_trt());
        assert!(CalibrationMethod::RtnTrtDq.dq_only());
        assert!(!CalibrationMethod::Rtn.dq_only());
        assert!(CalibrationMethod::AwqLite.requires_calibration_data());
        assert!(!CalibrationMethod::RtnDq.requires_calibration_data());
    }

    #[test]
    fn test_default_config() {
        let config = QuantizeConfig::default();
        assert_eq!(config.block_size, 128);
        assert_eq!(config.calibration_method, CalibrationMethod::AwqClip);
        assert!(!config.force_fp16);
        assert_eq!(config.qdq_ops(), QdqOpNames::onnx());
    }
}
