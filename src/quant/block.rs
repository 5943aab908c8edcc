//! Block-wise INT4 quantization primitives
//!
//! The numeric core of the weight-only quantization pipelines. Weights
//! arrive as rank-2 `[Cin, Cout]` arrays; the input-channel axis is
//! zero-padded up to a multiple of the block size, one scale is
//! computed per `[block, output-channel]` slice, and values are
//! rounded to the nearest integer with ties to even, clipped to the
//! signed 4-bit range `[-8, 7]` and stored in an 8-bit container.
//!
//! All primitives live here so an accelerated numeric backend can
//! replace this module behind the same signatures.

use ndarray::{s, Array2};

/// Default block size along the input-channel axis
pub const BLOCK_SIZE: usize = 128;

pub const NUM_BITS: u32 = 4;

/// Positive end of the symmetric INT4 range, used as scale divisor
pub const INT4_SCALE: f32 = 7.0;

pub const INT4_MIN: i8 = -(1 << (NUM_BITS - 1)); // -8
pub const INT4_MAX: i8 = (1 << (NUM_BITS - 1)) - 1; // 7

/// Scales at or below this magnitude quantize to exactly zero instead
/// of dividing through to NaN/Inf. Matches the smallest normal f16.
pub const ZERO_SCALE_EPSILON: f32 = 1.0 / (1u32 << 24) as f32;

/// Number of blocks covering `rows` after padding
pub fn num_blocks(rows: usize, block_size: usize) -> usize {
    rows.div_ceil(block_size)
}

fn pad_with<T: Clone + Default>(w: &Array2<T>, block_size: usize) -> Array2<T> {
    let (rows, cols) = w.dim();
    if rows % block_size == 0 {
        return w.clone();
    }
    let padded_rows = num_blocks(rows, block_size) * block_size;
    let mut out = Array2::from_elem((padded_rows, cols), T::default());
    out.slice_mut(s![0..rows, ..]).assign(w);
    out
}

/// Zero-pad axis 0 to the next multiple of `block_size`
pub fn pad(w: &Array2<f32>, block_size: usize) -> Array2<f32> {
    pad_with(w, block_size)
}

/// Truncate axis 0 back to `orig_rows`
pub fn depad<T: Clone>(w: Array2<T>, orig_rows: usize) -> Array2<T> {
    if w.nrows() == orig_rows {
        w
    } else {
        w.slice(s![0..orig_rows, ..]).to_owned()
    }
}

/// Per-(block, output-channel) max absolute value of the padded weight
pub fn block_amax(w: &Array2<f32>, block_size: usize) -> Array2<f32> {
    let padded = pad(w, block_size);
    let (rows, cols) = padded.dim();
    let blocks = rows / block_size;
    let mut amax = Array2::zeros((blocks, cols));
    for b in 0..blocks {
        let slab = padded.slice(s![b * block_size..(b + 1) * block_size, ..]);
        for j in 0..cols {
            let m = slab.column(j).iter().fold(0f32, |acc, &v| acc.max(v.abs()));
            amax[[b, j]] = m;
        }
    }
    amax
}

/// Scale factors `s = amax(block) * alpha / 7` with shape
/// `[ceil(Cin / block_size), Cout]`
pub fn find_scales(w: &Array2<f32>, block_size: usize, alpha: f32) -> Array2<f32> {
    block_amax(w, block_size).mapv(|amax| amax * alpha / INT4_SCALE)
}

/// `find_scales` with one alpha per (block, output channel)
pub fn find_scales_per_block(
    w: &Array2<f32>,
    block_size: usize,
    alpha: &Array2<f32>,
) -> Array2<f32> {
    let amax = block_amax(w, block_size);
    debug_assert_eq!(amax.dim(), alpha.dim());
    let mut s = amax;
    s.zip_mut_with(alpha, |a, &al| *a = *a * al / INT4_SCALE);
    s
}

/// Round-to-nearest quantization with ties to even, clipped to
/// `[-8, 7]`. Blocks whose scale is at or below the zero threshold
/// quantize to exactly 0.
pub fn rtn(w: &Array2<f32>, scales: &Array2<f32>, block_size: usize) -> Array2<i8> {
    let orig_rows = w.nrows();
    let padded = pad(w, block_size);
    let (rows, cols) = padded.dim();
    let mut q = Array2::<i8>::zeros((rows, cols));
    for i in 0..rows {
        let b = i / block_size;
        for j in 0..cols {
            let scale = scales[[b, j]];
            q[[i, j]] = if scale.abs() <= ZERO_SCALE_EPSILON {
                0
            } else {
                (padded[[i, j]] / scale)
                    .round_ties_even()
                    .clamp(INT4_MIN as f32, INT4_MAX as f32) as i8
            };
        }
    }
    depad(q, orig_rows)
}

/// Reconstruct a dequantized weight, each block scale broadcast across
/// its slice
pub fn dq_tensor(q: &Array2<i8>, scales: &Array2<f32>, block_size: usize) -> Array2<f32> {
    let orig_rows = q.nrows();
    let padded = pad_with(q, block_size);
    let (rows, cols) = padded.dim();
    let mut w = Array2::<f32>::zeros((rows, cols));
    for i in 0..rows {
        let b = i / block_size;
        for j in 0..cols {
            w[[i, j]] = padded[[i, j]] as f32 * scales[[b, j]];
        }
    }
    depad(w, orig_rows)
}

/// Quantize a tensor with a scalar alpha; returns `(quantized, scales)`
pub fn quant_tensor(w: &Array2<f32>, block_size: usize, alpha: f32) -> (Array2<i8>, Array2<f32>) {
    let scales = find_scales(w, block_size, alpha);
    let q = rtn(w, &scales, block_size);
    (q, scales)
}

/// Quantize a tensor with per-(block, output-channel) alphas
pub fn quant_tensor_per_block(
    w: &Array2<f32>,
    block_size: usize,
    alpha: &Array2<f32>,
) -> (Array2<i8>, Array2<f32>) {
    let scales = find_scales_per_block(w, block_size, alpha);
    let q = rtn(w, &scales, block_size);
    (q, scales)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use proptest::prelude::*;

    fn ramp(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            ((i * cols + j) as f32 * 0.173).sin() * 4.0
        })
    }

    #[test]
    fn test_pad_depad_round_trip() {
        let w = ramp(100, 8);
        let padded = pad(&w, 64);
        assert_eq!(padded.dim(), (128, 8));
        assert_abs_diff_eq!(padded[[99, 7]], w[[99, 7]]);
        assert_abs_diff_eq!(padded[[100, 0]], 0.0);
        let back = depad(padded, 100);
        assert_eq!(back, w);
    }

    #[test]
    fn test_pad_noop_on_aligned() {
        let w = ramp(128, 4);
        let padded = pad(&w, 128);
        assert_eq!(padded, w);
    }

    #[test]
    fn test_scale_shape_example() {
        // 256x64 weight with block 128 -> 2x64 scales
        let w = ramp(256, 64);
        let s = find_scales(&w, 128, 1.0);
        assert_eq!(s.dim(), (2, 64));
    }

    #[test]
    fn test_scales_are_amax_over_seven() {
        let mut w = Array2::zeros((4, 2));
        w[[0, 0]] = -3.5;
        w[[1, 0]] = 2.0;
        w[[2, 1]] = 7.0;
        let s = find_scales(&w, 4, 1.0);
        assert_eq!(s.dim(), (1, 2));
        assert_abs_diff_eq!(s[[0, 0]], 3.5 / 7.0, epsilon = 1e-6);
        assert_abs_diff_eq!(s[[0, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rtn_ties_to_even() {
        // scale of 1.0 per block: values 1.5 and 2.5 both round to 2
        let w = Array2::from_shape_vec((4, 1), vec![1.5, 2.5, -1.5, 7.0]).unwrap();
        let s = Array2::from_elem((1, 1), 1.0);
        let q = rtn(&w, &s, 4);
        assert_eq!(q[[0, 0]], 2);
        assert_eq!(q[[1, 0]], 2);
        assert_eq!(q[[2, 0]], -2);
        assert_eq!(q[[3, 0]], 7);
    }

    #[test]
    fn test_rtn_clips_to_int4_range() {
        let w = Array2::from_shape_vec((2, 1), vec![100.0, -100.0]).unwrap();
        let s = Array2::from_elem((1, 1), 1.0);
        let q = rtn(&w, &s, 2);
        assert_eq!(q[[0, 0]], 7);
        assert_eq!(q[[1, 0]], -8);
    }

    #[test]
    fn test_zero_scale_safety() {
        // A block of near-zero values must quantize and reconstruct to
        // exactly zero, never NaN/Inf
        let w = Array2::from_elem((4, 2), ZERO_SCALE_EPSILON / 4.0);
        let (q, s) = quant_tensor(&w, 4, 1.0);
        assert!(q.iter().all(|&v| v == 0));
        let dq = dq_tensor(&q, &s, 4);
        assert!(dq.iter().all(|&v| v == 0.0 && v.is_finite()));
    }

    #[test]
    fn test_dq_fidelity_bound() {
        let w = ramp(96, 6);
        let (q, s) = quant_tensor(&w, 32, 1.0);
        let dq = dq_tensor(&q, &s, 32);
        for i in 0..96 {
            for j in 0..6 {
                let bound = s[[i / 32, j]] / 2.0 + 1e-6;
                assert!(
                    (w[[i, j]] - dq[[i, j]]).abs() <= bound,
                    "rounding error exceeds s/2 at [{i},{j}]"
                );
            }
        }
    }

    #[test]
    fn test_unaligned_rows_round_trip_shape() {
        // 100 rows with block 64 pads to 128 internally but the
        // quantized tensor keeps the caller's shape
        let w = ramp(100, 3);
        let (q, s) = quant_tensor(&w, 64, 1.0);
        assert_eq!(q.dim(), (100, 3));
        assert_eq!(s.dim(), (2, 3));
        let dq = dq_tensor(&q, &s, 64);
        assert_eq!(dq.dim(), (100, 3));
    }

    #[test]
    fn test_per_block_alpha_matches_scalar_when_uniform() {
        let w = ramp(64, 4);
        let alpha = Array2::from_elem((2, 4), 0.7);
        let (q_a, s_a) = quant_tensor_per_block(&w, 32, &alpha);
        let (q_b, s_b) = quant_tensor(&w, 32, 0.7);
        assert_eq!(q_a, q_b);
        assert_eq!(s_a, s_b);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Quantized values always lie in [-8, 7]
        #[test]
        fn prop_rtn_bounded(
            values in prop::collection::vec(-50.0f32..50.0, 32..128),
            alpha in 0.5f32..1.0,
        ) {
            let rows = values.len();
            let w = Array2::from_shape_vec((rows, 1), values).unwrap();
            let (q, _) = quant_tensor(&w, 16, alpha);
            prop_assert!(q.iter().all(|&v| (INT4_MIN..=INT4_MAX).contains(&v)));
        }

        /// depad(pad(w)) == w for any block size
        #[test]
        fn prop_pad_depad_identity(
            rows in 1usize..200,
            cols in 1usize..8,
            block in 1usize..64,
        ) {
            let w = ramp(rows, cols);
            let padded = pad(&w, block);
            prop_assert_eq!(padded.nrows() % block, 0);
            let back = depad(padded, rows);
            prop_assert_eq!(back, w);
        }

        /// Dequantization reconstructs within half a scale step
        #[test]
        fn prop_dq_error_bounded(
            values in prop::collection::vec(-10.0f32..10.0, 64..256),
        ) {
            let rows = values.len();
            let w = Array2::from_shape_vec((rows, 1), values).unwrap();
            let (q, s) = quant_tensor(&w, 32, 1.0);
            let dq = dq_tensor(&q, &s, 32);
            for i in 0..rows {
                let bound = s[[i / 32, 0]] / 2.0 + 1e-6;
                prop_assert!((w[[i, 0]] - dq[[i, 0]]).abs() <= bound);
            }
        }
    }
}
