//! Afinar CLI entry point

use clap::Parser;
use tracing_subscriber::EnvFilter;

use afinar::cli::{Cli, Command};
use afinar::graph::qdq::collect_quantization_stats;
use afinar::quant::{
    CalibrationMethod, QuantizeConfig, RandomDataProvider, ReferenceSessionFactory,
};
use afinar::{io, quantize, Result};

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Quantize(args) => {
            let method: CalibrationMethod = args.method.parse()?;
            let config = QuantizeConfig {
                calibration_method: method,
                block_size: args.block_size,
                force_fp16: args.force_fp16,
                enable_fast_path_using_high_sysram: args.fast_path,
                use_external_data_format: args.external_data,
            };

            let sessions = ReferenceSessionFactory {
                use_external_data_format: args.external_data,
            };

            let graph = if method.requires_calibration_data() {
                let source = io::load_graph(&args.model, args.external_data)?;
                let mut reader =
                    RandomDataProvider::from_graph(&source, args.calib_samples, args.seed);
                quantize(&args.model, &config, Some(&mut reader), &sessions)?
            } else {
                quantize(&args.model, &config, None, &sessions)?
            };

            io::save_graph(&graph, &args.output, args.external_data)?;
            println!("quantized model written to {}", args.output.display());
            Ok(())
        }
        Command::Info(args) => {
            let graph = io::load_graph(&args.model, args.external_data)?;
            let stats = collect_quantization_stats(&graph);
            println!("total nodes: {}", graph.num_nodes());
            println!("quantized nodes: {}", stats.total);
            for (op, count) in &stats.by_op {
                println!("  {op}: {count}");
            }
            if cli.verbose {
                for name in &stats.nodes {
                    println!("  - {name}");
                }
            }
            Ok(())
        }
    }
}
