//! AWQ-Clip calibration
//!
//! Grid search over a scale-shrink exponent: for each alpha the whole
//! weight is requantized with `s = amax * alpha / 7`, and the
//! reconstruction is projected against sampled activation tokens. The
//! squared error accumulates per (block, output channel), and each
//! block keeps the alpha that minimized its loss.

use std::collections::HashMap;

use indicatif::ProgressBar;
use ndarray::{s, Array2, Axis};
use tracing::info;

use crate::graph::qdq::insert_dq_nodes;
use crate::graph::{Graph, TensorData};
use crate::quant::block::{dq_tensor, num_blocks, pad, quant_tensor, quant_tensor_per_block};
use crate::quant::calib::CalibrationDataReader;
use crate::quant::rtn::weight_as_2d;
use crate::quant::session::SessionFactory;
use crate::quant::QuantizeConfig;
use crate::{io, Error, Result};

const MIN_ALPHA: f32 = 0.5;
const ALPHA_STEP: f32 = 0.05;

/// Tokens sampled from the activation stream per weight
const MAX_TOKENS: usize = 64;

/// The clip search grid: 0.5, 0.55, ... 0.95, 1.0
pub fn clip_alphas() -> Vec<f32> {
    let steps = ((1.0 - MIN_ALPHA) / ALPHA_STEP) as usize;
    let mut alphas: Vec<f32> = (0..steps)
        .map(|k| ((MIN_ALPHA + k as f32 * ALPHA_STEP) * 100.0).round() / 100.0)
        .collect();
    alphas.push(1.0);
    alphas
}

/// Per-weight clip search state
pub struct AwqClipHelper {
    pub block_size: usize,
    /// Accumulated loss per alpha, each `[n_blocks, co]`
    pub loss: Vec<(f32, Array2<f32>)>,
    pub best_loss: Array2<f32>,
    pub best_alpha: Array2<f32>,
}

impl AwqClipHelper {
    pub fn new(w: &Array2<f32>, block_size: usize) -> Self {
        let (ci, co) = w.dim();
        let blocks = num_blocks(ci, block_size);
        Self {
            block_size,
            loss: clip_alphas()
                .into_iter()
                .map(|a| (a, Array2::zeros((blocks, co))))
                .collect(),
            best_loss: Array2::from_elem((blocks, co), f32::INFINITY),
            best_alpha: Array2::ones((blocks, co)),
        }
    }

    /// Fold the accumulated losses into per-block best alphas
    pub fn update_best_params(&mut self) {
        for (alpha, loss) in &self.loss {
            for ((b, j), &l) in loss.indexed_iter() {
                if l < self.best_loss[[b, j]] {
                    self.best_loss[[b, j]] = l;
                    self.best_alpha[[b, j]] = *alpha;
                }
            }
        }
    }
}

/// Run the alpha grid search for one weight against sampled tokens.
///
/// `x` is the captured activation stream `[tokens, ci]`, `w` the
/// weight `[ci, co]`. Accumulates into `helper.loss`.
pub fn clip_search(x: &Array2<f32>, w: &Array2<f32>, helper: &mut AwqClipHelper) {
    let block_size = helper.block_size;

    // Sample up to MAX_TOKENS rows, evenly strided
    let stride = (x.nrows() / MAX_TOKENS).max(1) as isize;
    let sampled = x.slice(s![..;stride, ..]).to_owned();

    let w_padded = pad(w, block_size);
    let x_padded = pad(&sampled.t().to_owned(), block_size).t().to_owned();
    let blocks = w_padded.nrows() / block_size;

    // One QDQ reconstruction per alpha over the whole weight
    let reconstructions: Vec<(usize, Array2<f32>)> = (0..helper.loss.len())
        .map(|idx| {
            let alpha = helper.loss[idx].0;
            let (qw, scales) = quant_tensor(&w_padded, block_size, alpha);
            (idx, dq_tensor(&qw, &scales, block_size))
        })
        .collect();

    for b in 0..blocks {
        let rows = s![b * block_size..(b + 1) * block_size, ..];
        let xb = x_padded.slice(s![.., b * block_size..(b + 1) * block_size]);
        let wb = w_padded.slice(rows);
        // Per-block partial products of the original weight
        let org_out = xb.dot(&wb); // [tokens, co]

        for (idx, dqw) in &reconstructions {
            let cur_out = xb.dot(&dqw.slice(rows));
            let sq_err = (&org_out - &cur_out).mapv(|d| d * d);
            let mean = sq_err.mean_axis(Axis(0)).expect("tokens > 0");
            let mut row = helper.loss[*idx].1.row_mut(b);
            row += &mean;
        }
    }
}

/// Quantize using AWQ-Clip calibration, mutating the graph in place.
pub fn quantize_awq_clip(
    graph: &mut Graph,
    data_reader: &mut dyn CalibrationDataReader,
    sessions: &dyn SessionFactory,
    config: &QuantizeConfig,
) -> Result<()> {
    info!("finding quantizable weights and augmenting graph outputs");
    let wa_pack = crate::analyze::find_quantizable_weights(graph);
    if wa_pack.is_empty() {
        info!("no quantizable weights found, leaving graph unmodified");
        return Ok(());
    }

    let mut augmented = graph.clone();
    for pack in &wa_pack {
        augmented.add_output(pack.act_tensor);
    }

    let augmented_path = io::temp_model_path("awq_clip_augmented")?;
    let search = (|| -> Result<HashMap<String, Array2<f32>>> {
        io::save_graph(&augmented, &augmented_path, config.use_external_data_format)?;
        let mut session = sessions.create(&augmented_path)?;
        let inputs = data_reader.collect_feeds();

        let mut best_alphas = HashMap::new();
        let progress = ProgressBar::new(wa_pack.len() as u64);
        for pack in &wa_pack {
            let act_name = graph.tensor(pack.act_tensor).name.clone();

            // Capture this activation across the calibration sweep
            let mut captures = Vec::with_capacity(inputs.len());
            for feed in &inputs {
                let out = session.run(std::slice::from_ref(&act_name), feed)?;
                captures.push(out.into_iter().next().expect("one output requested"));
            }
            let x = concat_tokens(&captures)?;

            let weight_name = graph.tensor(pack.weight_tensor).name.clone();
            let data = graph
                .tensor(pack.weight_tensor)
                .data()
                .ok_or_else(|| Error::MissingTensor(weight_name.clone()))?;
            let mut w = weight_as_2d(data)
                .ok_or_else(|| Error::Numeric(format!("weight '{weight_name}' is not rank 2")))?;
            if pack.do_transpose {
                w = w.t().to_owned();
            }

            let mut helper = AwqClipHelper::new(&w, config.block_size);
            clip_search(&x, &w, &mut helper);
            helper.update_best_params();
            best_alphas.insert(weight_name, helper.best_alpha);
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(best_alphas)
    })();
    io::remove_intermediate_files(&[
        augmented_path.clone(),
        io::external_data_path(&augmented_path),
    ]);
    let best_alphas = search?;
    info!("clip search finished for all weights");

    // Quantize the actual weights with their per-block alphas
    let mut scales: HashMap<String, TensorData> = HashMap::new();
    let mut quantized: HashMap<String, Array2<i8>> = HashMap::new();
    for pack in &wa_pack {
        let weight_name = graph.tensor(pack.weight_tensor).name.clone();
        let act_name = graph.tensor(pack.act_tensor).name.clone();
        let gemm_io_type = if config.force_fp16 {
            crate::graph::DataType::F16
        } else {
            pack.io_dtype
        };

        let data = graph
            .tensor(pack.weight_tensor)
            .data()
            .ok_or_else(|| Error::MissingTensor(weight_name.clone()))?;
        let mut w = weight_as_2d(data)
            .ok_or_else(|| Error::Numeric(format!("weight '{weight_name}' is not rank 2")))?;
        if pack.do_transpose {
            w = w.t().to_owned();
        }

        let (mut qw, mut scale) = match best_alphas.get(&weight_name) {
            Some(alpha) => quant_tensor_per_block(&w, config.block_size, alpha),
            None => quant_tensor(&w, config.block_size, 1.0),
        };
        if pack.do_transpose {
            qw = qw.t().to_owned();
            scale = scale.t().to_owned();
        }

        scales.insert(
            weight_name.clone(),
            TensorData::from_f32(scale.into_dyn(), gemm_io_type)?,
        );
        quantized.insert(weight_name, qw);
        graph.set_tensor_dtype(&act_name, gemm_io_type)?;
    }
    info!(count = scales.len(), "quantized weights, inserting DQ nodes");

    insert_dq_nodes(graph, &scales, &quantized, config.block_size, config.qdq_ops())?;
    Ok(())
}

/// Concatenate captured activation batches and flatten to `[tokens, ci]`
pub(crate) fn concat_tokens(captures: &[ndarray::ArrayD<f32>]) -> Result<Array2<f32>> {
    let first = captures
        .first()
        .ok_or_else(|| Error::Config("no calibration data provided".to_string()))?;
    let ci = *first
        .shape()
        .last()
        .ok_or_else(|| Error::Numeric("scalar activation capture".to_string()))?;
    let mut rows = Vec::new();
    for capture in captures {
        let tokens = capture.len() / ci;
        let flat = capture
            .to_shape((tokens, ci))
            .map_err(|e| Error::Numeric(format!("activation reshape: {e}")))?
            .to_owned();
        rows.push(flat);
    }
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| Error::Numeric(format!("activation concat: {e}")))
}
