//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! afinar quantize model.json -o model.int4.json
//! afinar quantize model.json -o out.json --method awq_lite --block-size 64
//! afinar info model.int4.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Afinar: Post-Training Model Optimization
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "afinar")]
#[command(version)]
#[command(about = "INT4 weight-only quantization for ONNX-style compute graphs")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Quantize a model's weights to INT4
    Quantize(QuantizeArgs),

    /// Display quantization statistics of a model
    Info(InfoArgs),
}

/// Arguments for the quantize command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct QuantizeArgs {
    /// Path to the model file
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    /// Output path for the quantized model
    #[arg(short, long)]
    pub output: PathBuf,

    /// Calibration method (rtn, rtn_dq, awq_clip, awq_lite, ...)
    #[arg(short, long, default_value = "awq_clip")]
    pub method: String,

    /// Block size along the input-channel axis
    #[arg(short, long, default_value_t = 128)]
    pub block_size: usize,

    /// Coerce computed scales to f16
    #[arg(long)]
    pub force_fp16: bool,

    /// Cache all activations in host memory during calibration
    #[arg(long)]
    pub fast_path: bool,

    /// Read and write weights through a raw side file
    #[arg(long)]
    pub external_data: bool,

    /// Number of random calibration samples when no data is supplied
    #[arg(long, default_value_t = 1)]
    pub calib_samples: usize,

    /// Random seed for synthesized calibration data
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to the model file
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    /// Read weights through a raw side file
    #[arg(long)]
    pub external_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantize() {
        let cli = Cli::parse_from([
            "afinar",
            "quantize",
            "model.json",
            "-o",
            "out.json",
            "--method",
            "awq_lite",
            "--block-size",
            "64",
            "--force-fp16",
        ]);
        match cli.command {
            Command::Quantize(args) => {
                assert_eq!(args.model, PathBuf::from("model.json"));
                assert_eq!(args.output, PathBuf::from("out.json"));
                assert_eq!(args.method, "awq_lite");
                assert_eq!(args.block_size, 64);
                assert!(args.force_fp16);
                assert!(!args.fast_path);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_info_with_globals() {
        let cli = Cli::parse_from(["afinar", "info", "model.json", "--verbose"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Info(_)));
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["afinar", "quantize", "m.json", "-o", "q.json"]);
        match cli.command {
            Command::Quantize(args) => {
                assert_eq!(args.method, "awq_clip");
                assert_eq!(args.block_size, 128);
                assert_eq!(args.calib_samples, 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
