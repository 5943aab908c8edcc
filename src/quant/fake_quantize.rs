//! Fake tensor quantization
//!
//! Simulates reduced-precision arithmetic while keeping tensors in a
//! floating-point container: values are scaled by `max_bound / amax`,
//! rounded with ties to even, clipped to the integer range, and (for
//! the fake variant) divided back out.
//!
//! Numeric edge cases handled here rather than by the caller:
//! - negative inputs under unsigned quantization are rejected
//! - a negative amax is an invariant violation and errors out
//! - amax at or below `2^-24` quantizes to exactly 0 (the returned
//!   scale is 1 for those elements, so dequantization stays finite)
//! - half-precision inputs are upcast to f32 internally and downcast
//!   on return

use half::f16;
use ndarray::ArrayD;

use crate::quant::block::ZERO_SCALE_EPSILON;
use crate::{Error, Result};

/// Fake quantization configuration
#[derive(Clone, Copy, Debug)]
pub struct FakeQuantConfig {
    /// Number of bits (e.g. 4, 8)
    pub num_bits: u32,
    /// Use the unsigned integer range, e.g. [0, 255] for 8 bits
    pub unsigned: bool,
    /// Symmetric range [-max_bound, max_bound] instead of
    /// [-max_bound - 1, max_bound]
    pub narrow_range: bool,
}

impl FakeQuantConfig {
    pub fn new(num_bits: u32) -> Self {
        Self {
            num_bits,
            unsigned: false,
            narrow_range: true,
        }
    }

    pub fn unsigned(num_bits: u32) -> Self {
        Self {
            num_bits,
            unsigned: true,
            narrow_range: false,
        }
    }

    /// Largest representable magnitude
    pub fn max_bound(&self) -> f32 {
        (2f64.powi((self.num_bits - 1 + u32::from(self.unsigned)) as i32) - 1.0) as f32
    }

    /// Smallest representable value
    pub fn min_bound(&self) -> f32 {
        if self.unsigned {
            0.0
        } else if self.narrow_range {
            -self.max_bound()
        } else {
            -self.max_bound() - 1.0
        }
    }
}

impl Default for FakeQuantConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Quantize `inputs` against `amax` (broadcast over the input shape).
///
/// Returns `(quantized, scale)`: integer-valued outputs in a float
/// container plus the elementwise scale used, with zero-amax elements
/// carrying scale 1.
pub fn tensor_quant(
    inputs: &ArrayD<f32>,
    amax: &ArrayD<f32>,
    config: FakeQuantConfig,
) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
    if config.unsigned {
        let min_input = inputs.iter().cloned().fold(f32::INFINITY, f32::min);
        if min_input < 0.0 {
            return Err(Error::Numeric(
                "negative values encountered in unsigned quantization".to_string(),
            ));
        }
    }
    if amax.iter().any(|&a| a < 0.0) {
        return Err(Error::Numeric("negative values in amax".to_string()));
    }

    let max_bound = config.max_bound();
    let min_bound = config.min_bound();

    // Scale is zeroed where amax is (near) zero so those elements
    // quantize to 0 instead of overflowing
    let scale = amax.mapv(|a| if a <= ZERO_SCALE_EPSILON { 0.0 } else { max_bound / a });

    let broadcast = scale
        .broadcast(inputs.raw_dim())
        .ok_or_else(|| Error::ShapeMismatch {
            expected: inputs.shape().to_vec(),
            got: amax.shape().to_vec(),
        })?;

    let mut outputs = inputs.clone();
    outputs.zip_mut_with(&broadcast, |x, &s| {
        *x = (*x * s).round_ties_even().clamp(min_bound, max_bound);
    });

    // Unit scale for zeroed elements keeps dequantization finite
    let scale = scale.mapv(|s| if s == 0.0 { 1.0 } else { s });

    Ok((outputs, scale))
}

/// Quantize then dequantize: the fake-quantized value in full precision
pub fn fake_tensor_quant(
    inputs: &ArrayD<f32>,
    amax: &ArrayD<f32>,
    config: FakeQuantConfig,
) -> Result<ArrayD<f32>> {
    let (quantized, scale) = tensor_quant(inputs, amax, config)?;
    let broadcast = scale
        .broadcast(quantized.raw_dim())
        .expect("scale broadcast checked in tensor_quant");
    let mut outputs = quantized;
    outputs.zip_mut_with(&broadcast, |x, &s| *x /= s);
    Ok(outputs)
}

/// Half-precision entry point: computation happens in f32, the result
/// is downcast back to f16
pub fn fake_tensor_quant_f16(
    inputs: &ArrayD<f16>,
    amax: &ArrayD<f32>,
    config: FakeQuantConfig,
) -> Result<ArrayD<f16>> {
    let wide = inputs.mapv(f16::to_f32);
    let out = fake_tensor_quant(&wide, amax, config)?;
    Ok(out.mapv(f16::from_f32))
}
