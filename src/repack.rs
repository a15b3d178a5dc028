//! Bias-fusion repack kernel
//!
//! Takes the three raw projection outputs (one row per token, `hidden`
//! elements each), adds the per-channel biases, and interleaves the
//! result into the single fused buffer the attention kernel consumes:
//! for every token and head, the bias-adjusted query, key, and value
//! vectors are stored contiguously and in that order.
//!
//! One pass replaces three bias-add launches plus a layout transpose.
//! Work units are independent (token, head, lane) triples with no data
//! hazards, so the pass parallelizes freely over tokens.
//!
//! The bias add happens in the element type `T`. No widening: the fused
//! values must match what a device kernel adding bias in the projection's
//! own precision would produce.

use rayon::prelude::*;

use crate::error::{AtenderError, Result};
use crate::tensor::Element;

/// Element stride of one token block in the fused buffer
#[inline]
#[must_use]
pub fn fused_token_stride(num_heads: usize, head_dim: usize) -> usize {
    3 * num_heads * head_dim
}

/// Offset of `(head, slot, lane)` within one fused token block, where
/// slot 0 is query, 1 is key, 2 is value
#[inline]
#[must_use]
pub fn fused_offset(head: usize, slot: usize, lane: usize, head_dim: usize) -> usize {
    head * 3 * head_dim + slot * head_dim + lane
}

/// Fuse bias addition with the interleaving repack
///
/// `q`, `k`, `v` hold `tokens` rows of `num_heads * head_dim` elements;
/// each bias has `num_heads * head_dim` entries. Writes `tokens` blocks
/// of `3 * num_heads * head_dim` elements into `fused`.
///
/// # Errors
///
/// Returns `Err` when any buffer is shorter than the geometry requires.
#[allow(clippy::too_many_arguments)]
pub fn fused_bias_repack<T: Element>(
    q: &[T],
    k: &[T],
    v: &[T],
    bias_q: &[T],
    bias_k: &[T],
    bias_v: &[T],
    fused: &mut [T],
    tokens: usize,
    num_heads: usize,
    head_dim: usize,
) -> Result<()> {
    let hidden = num_heads * head_dim;
    let stride = fused_token_stride(num_heads, head_dim);

    for (name, buf) in [("q", q), ("k", k), ("v", v)] {
        if buf.len() < tokens * hidden {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "{name} buffer holds {} elements, repack needs {}",
                    buf.len(),
                    tokens * hidden
                ),
            });
        }
    }
    for (name, bias) in [("bias_q", bias_q), ("bias_k", bias_k), ("bias_v", bias_v)] {
        if bias.len() != hidden {
            return Err(AtenderError::DataShapeMismatch {
                data_size: bias.len(),
                shape: vec![hidden],
                expected: hidden,
            });
        }
    }
    if fused.len() < tokens * stride {
        return Err(AtenderError::InvalidShape {
            reason: format!(
                "fused buffer holds {} elements, repack needs {}",
                fused.len(),
                tokens * stride
            ),
        });
    }

    fused
        .par_chunks_mut(stride)
        .take(tokens)
        .enumerate()
        .for_each(|(s, block)| {
            let row = s * hidden;
            for h in 0..num_heads {
                let ch = h * head_dim;
                for d in 0..head_dim {
                    block[fused_offset(h, 0, d, head_dim)] = q[row + ch + d] + bias_q[ch + d];
                    block[fused_offset(h, 1, d, head_dim)] = k[row + ch + d] + bias_k[ch + d];
                    block[fused_offset(h, 2, d, head_dim)] = v[row + ch + d] + bias_v[ch + d];
                }
            }
        });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    /// Builds distinguishable synthetic values: projection p, token s,
    /// channel c
    fn val(p: usize, s: usize, c: usize) -> f32 {
        (p * 1000 + s * 100 + c) as f32 * 0.01
    }

    #[test]
    fn test_fused_layout_equations() {
        let (tokens, heads, head_dim) = (3, 2, 4);
        let hidden = heads * head_dim;

        let q: Vec<f32> = (0..tokens * hidden).map(|i| val(0, i / hidden, i % hidden)).collect();
        let k: Vec<f32> = (0..tokens * hidden).map(|i| val(1, i / hidden, i % hidden)).collect();
        let v: Vec<f32> = (0..tokens * hidden).map(|i| val(2, i / hidden, i % hidden)).collect();
        let bias_q: Vec<f32> = (0..hidden).map(|c| 0.5 + c as f32).collect();
        let bias_k: Vec<f32> = (0..hidden).map(|c| 1.5 + c as f32).collect();
        let bias_v: Vec<f32> = (0..hidden).map(|c| 2.5 + c as f32).collect();

        let stride = fused_token_stride(heads, head_dim);
        let mut fused = vec![0.0f32; tokens * stride];
        fused_bias_repack(
            &q, &k, &v, &bias_q, &bias_k, &bias_v, &mut fused, tokens, heads, head_dim,
        )
        .unwrap();

        // Check every (token, head, lane) triple against the defining
        // equations, element by element.
        for s in 0..tokens {
            for h in 0..heads {
                for d in 0..head_dim {
                    let c = h * head_dim + d;
                    let block = &fused[s * stride..];
                    assert_eq!(
                        block[fused_offset(h, 0, d, head_dim)],
                        q[s * hidden + c] + bias_q[c],
                        "query mismatch at s={s} h={h} d={d}"
                    );
                    assert_eq!(
                        block[fused_offset(h, 1, d, head_dim)],
                        k[s * hidden + c] + bias_k[c],
                        "key mismatch at s={s} h={h} d={d}"
                    );
                    assert_eq!(
                        block[fused_offset(h, 2, d, head_dim)],
                        v[s * hidden + c] + bias_v[c],
                        "value mismatch at s={s} h={h} d={d}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_interleave_order_is_q_k_v() {
        let (tokens, heads, head_dim) = (1, 1, 2);
        let q = vec![10.0f32, 11.0];
        let k = vec![20.0f32, 21.0];
        let v = vec![30.0f32, 31.0];
        let zero = vec![0.0f32; 2];
        let mut fused = vec![0.0f32; 6];
        fused_bias_repack(&q, &k, &v, &zero, &zero, &zero, &mut fused, tokens, heads, head_dim)
            .unwrap();
        assert_eq!(fused, vec![10.0, 11.0, 20.0, 21.0, 30.0, 31.0]);
    }

    #[test]
    fn test_bias_add_rounds_in_half_precision() {
        // 2048 + 1 is not representable in f16; a widened add would keep
        // the +1 and betray an implicit upcast.
        let q = vec![f16::from_f32(2048.0)];
        let k = vec![f16::from_f32(0.0)];
        let v = vec![f16::from_f32(0.0)];
        let bias = vec![f16::from_f32(1.0)];
        let zero = vec![f16::from_f32(0.0)];
        let mut fused = vec![f16::from_f32(0.0); 3];
        fused_bias_repack(&q, &k, &v, &bias, &zero, &zero, &mut fused, 1, 1, 1).unwrap();
        assert_eq!(fused[0], f16::from_f32(2048.0));
    }

    #[test]
    fn test_rejects_short_buffers() {
        let buf = vec![0.0f32; 4];
        let bias = vec![0.0f32; 8];
        let mut fused = vec![0.0f32; 24];
        let err = fused_bias_repack(&buf, &buf, &buf, &bias, &bias, &bias, &mut fused, 1, 2, 4)
            .unwrap_err();
        assert!(matches!(err, AtenderError::InvalidShape { .. }));
    }

    #[test]
    fn test_rejects_wrong_bias_len() {
        let buf = vec![0.0f32; 8];
        let bias = vec![0.0f32; 4];
        let mut fused = vec![0.0f32; 24];
        let err = fused_bias_repack(&buf, &buf, &buf, &bias, &bias, &bias, &mut fused, 1, 2, 4)
            .unwrap_err();
        assert!(matches!(err, AtenderError::DataShapeMismatch { .. }));
    }

    #[test]
    fn test_oversized_fused_buffer_tail_untouched() {
        // Workspace buffers are sized for the configured maxima, so the
        // kernel regularly writes into a prefix of a larger region.
        let buf = vec![1.0f32; 2];
        let bias = vec![0.0f32; 2];
        let mut fused = vec![9.0f32; 12];
        fused_bias_repack(&buf, &buf, &buf, &bias, &bias, &bias, &mut fused, 1, 1, 2).unwrap();
        assert!(fused[6..].iter().all(|&x| x == 9.0));
    }
}
