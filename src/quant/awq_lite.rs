//! AWQ-Lite calibration
//!
//! Closed-form activation-aware scaling: per input channel, the scale
//! interpolates between activation magnitude and normalized weight
//! magnitude via a single exponent, `s = act^alpha / w^(1-alpha)`.
//! The grid search picks the alpha minimizing the matmul-output MSE
//! over the whole calibration set. The chosen scale multiplies the
//! weight before quantization, and its inverse rides along as a
//! pre-quant-scale multiply on the activation input.

use std::collections::HashMap;

use indicatif::ProgressBar;
use ndarray::{Array1, Array2, ArrayD, Axis};
use tracing::info;

use crate::graph::qdq::{insert_dq_nodes, insert_pre_quant_scale_nodes};
use crate::graph::{Graph, TensorData};
use crate::quant::awq_clip::concat_tokens;
use crate::quant::block::{depad, dq_tensor, pad, quant_tensor};
use crate::quant::calib::CalibrationDataReader;
use crate::quant::rtn::weight_as_2d;
use crate::quant::session::SessionFactory;
use crate::quant::QuantizeConfig;
use crate::{io, Error, Result};

const ALPHA_STEP: f32 = 0.1;

/// The lite search grid: 0.0, 0.1, ... 1.0
pub fn lite_alphas() -> Vec<f32> {
    (0..=10).map(|k| k as f32 * ALPHA_STEP).collect()
}

/// Per-channel activation magnitude, `mean(|x|)` over tokens
pub fn get_act_scale(x: &Array2<f32>) -> Array1<f32> {
    x.mapv(f32::abs).mean_axis(Axis(0)).expect("tokens > 0")
}

/// Per-channel weight magnitude: each element normalized by its
/// block's max, averaged over output channels
pub fn get_weight_scale(w: &Array2<f32>, block_size: usize) -> Array1<f32> {
    let (ci, co) = w.dim();
    let padded = pad(w, block_size);
    let rows = padded.nrows();
    let lanes = rows * co / block_size;

    let flat = padded
        .to_shape((block_size, lanes))
        .expect("padded weight is contiguous")
        .to_owned();
    let amax = flat
        .mapv(f32::abs)
        .fold_axis(Axis(0), 0f32, |acc, &v| acc.max(v));
    let mut scale = flat.mapv(f32::abs);
    for mut row in scale.rows_mut() {
        row.zip_mut_with(&amax, |v, &m| *v /= m + f32::MIN_POSITIVE);
    }
    let scale = scale
        .to_shape((rows, co))
        .expect("scale keeps the padded shape")
        .to_owned();
    let scale = depad(scale, ci);
    scale.mean_axis(Axis(1)).expect("co > 0")
}

/// The AWQ scale `s = clip(act^alpha / (w^(1-alpha) + tiny), 1e-4,
/// 1e4)`, normalized by the geometric mean of its extremes
pub fn get_scale(x_max: &Array1<f32>, w_max: &Array1<f32>, alpha: f32) -> Array1<f32> {
    let mut scales = Array1::from_shape_fn(x_max.len(), |i| {
        (x_max[i].powf(alpha) / (w_max[i].powf(1.0 - alpha) + f32::MIN_POSITIVE))
            .clamp(1e-4, 1e4)
    });
    let max = scales.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let min = scales.iter().cloned().fold(f32::INFINITY, f32::min);
    let norm = (max * min).sqrt();
    scales.mapv_inplace(|s| s / norm);
    scales
}

/// Per-weight lite search state
pub struct AwqLiteHelper {
    pub block_size: usize,
    pub act_scale: Array1<f32>,
    pub weight_scale: Array1<f32>,
    /// Loss per alpha over the full calibration set
    pub loss: Vec<(f32, f32)>,
    pub best_alpha: Option<f32>,
    pub best_scale: Option<Array1<f32>>,
}

impl AwqLiteHelper {
    pub fn new(x: &Array2<f32>, w: &Array2<f32>, block_size: usize) -> Self {
        Self {
            block_size,
            act_scale: get_act_scale(x),
            weight_scale: get_weight_scale(w, block_size),
            loss: lite_alphas().into_iter().map(|a| (a, 0.0)).collect(),
            best_alpha: None,
            best_scale: None,
        }
    }
}

/// Quantize using AWQ-Lite calibration, mutating the graph in place.
pub fn quantize_awq_lite(
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

    let act_names: Vec<String> = wa_pack
        .iter()
        .map(|p| graph.tensor(p.act_tensor).name.clone())
        .collect();

    let augmented_path = io::temp_model_path("awq_lite_augmented")?;
    let search = (|| -> Result<Vec<AwqLiteHelper>> {
        io::save_graph(&augmented, &augmented_path, config.use_external_data_format)?;
        let mut session = sessions.create(&augmented_path)?;
        let inputs = data_reader.collect_feeds();

        // Fast path: one inference sweep caches every activation in
        // host memory, trading RAM for per-weight session runs
        let mut cached: Vec<Vec<Option<ArrayD<f32>>>> = Vec::new();
        if config.enable_fast_path_using_high_sysram {
            info!("fast path enabled, caching all activations up front");
            let progress = ProgressBar::new(inputs.len() as u64);
            for feed in &inputs {
                let outputs = session.run(&act_names, feed)?;
                cached.push(outputs.into_iter().map(Some).collect());
                progress.inc(1);
            }
            progress.finish_and_clear();
        }

        let mut helpers = Vec::with_capacity(wa_pack.len());
        let progress = ProgressBar::new(wa_pack.len() as u64);
        for (idx, pack) in wa_pack.iter().enumerate() {
            let act_name = &act_names[idx];

            let captures: Vec<ArrayD<f32>> = if config.enable_fast_path_using_high_sysram {
                cached
                    .iter_mut()
                    .map(|feed_outputs| {
                        feed_outputs[idx]
                            .take()
                            .ok_or_else(|| Error::Numeric("activation cache consumed twice".into()))
                    })
                    .collect::<Result<_>>()?
            } else {
                let mut captures = Vec::with_capacity(inputs.len());
                for feed in &inputs {
                    let out = session.run(std::slice::from_ref(act_name), feed)?;
                    captures.push(out.into_iter().next().expect("one output requested"));
                }
                captures
            };

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

            let x = concat_tokens(&captures)?;
            let mut helper = AwqLiteHelper::new(&x, &w, config.block_size);

            let out_actual = x.dot(&w);
            for i in 0..helper.loss.len() {
                let alpha = helper.loss[i].0;
                let awq_scale = get_scale(&helper.act_scale, &helper.weight_scale, alpha);
                let x_scaled = &x / &awq_scale;
                let w_scaled = &w * &awq_scale.view().insert_axis(Axis(1));
                let (qw, scales) = quant_tensor(&w_scaled, config.block_size, 1.0);
                let dqw = dq_tensor(&qw, &scales, config.block_size);
                let out_curr = x_scaled.dot(&dqw);
                let loss = (&out_actual - &out_curr).mapv(|d| d * d).mean().unwrap_or(0.0);
                helper.loss[i].1 = loss;
            }
            helpers.push(helper);
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(helpers)
    })();
    io::remove_intermediate_files(&[
        augmented_path.clone(),
        io::external_data_path(&augmented_path),
    ]);
    let mut helpers = search?;
    info!("activation caching and alpha grid search finished");

    for helper in &mut helpers {
        let (best_alpha, _) = helper
            .loss
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .expect("non-empty alpha grid");
        helper.best_alpha = Some(best_alpha);
        helper.best_scale = Some(get_scale(
            &helper.act_scale,
            &helper.weight_scale,
            best_alpha,
        ));
    }

    // Quantize the actual weights with their best scales
    let mut scales: HashMap<String, TensorData> = HashMap::new();
    let mut quantized: HashMap<String, Array2<i8>> = HashMap::new();
    let mut input_tensors: HashMap<String, String> = HashMap::new();
    let mut pre_quant_scales: HashMap<String, TensorData> = HashMap::new();

    for (pack, helper) in wa_pack.iter().zip(helpers.iter()) {
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

        let best_scale = helper.best_scale.as_ref().expect("selected above");
        let w_scaled = &w * &best_scale.view().insert_axis(Axis(1));
        let (mut qw, mut scale) = quant_tensor(&w_scaled, config.block_size, 1.0);
        if pack.do_transpose {
            qw = qw.t().to_owned();
            scale = scale.t().to_owned();
        }

        // The inverse scale pre-multiplies the activation at runtime
        let inv_scale = best_scale.mapv(|s| 1.0 / s);
        let pqs = inv_scale
            .insert_axis(Axis(0))
            .into_dyn();

        scales.insert(
            weight_name.clone(),
            TensorData::from_f32(scale.into_dyn(), gemm_io_type)?,
        );
        quantized.insert(weight_name.clone(), qw);
        input_tensors.insert(weight_name.clone(), act_name.clone());
        pre_quant_scales.insert(weight_name, TensorData::from_f32(pqs, gemm_io_type)?);
        graph.set_tensor_dtype(&act_name, gemm_io_type)?;
    }
    info!(count = scales.len(), "quantized weights, inserting DQ and pre-quant-scale nodes");

    insert_dq_nodes(graph, &scales, &quantized, config.block_size, config.qdq_ops())?;
    insert_pre_quant_scale_nodes(graph, &input_tensors, &pre_quant_scales)?;
    Ok(())
}
