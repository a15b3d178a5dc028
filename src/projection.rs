//! Projection path selection and execution
//!
//! Each forward call computes four linear projections: query, key, and
//! value from the token embeddings, and the output projection from the
//! post-attention context. The dispatcher picks one of three provider
//! strategies per call:
//!
//! - structured-sparse, when the layer enables sparsity, the weights
//!   carry sparse encodings, and the provider reports the shape
//!   favorable;
//! - batched, one provider call covering all three Q/K/V matmuls;
//! - dense, the three-call fallback.
//!
//! The output projection chooses only between dense and sparse, since a
//! single matmul has nothing to batch. Sparse calls always receive the
//! padded row count: the row total rounded up to the next multiple of 8,
//! the sparse kernel's alignment unit.

use rayon::prelude::*;

use crate::error::{AtenderError, Result};
use crate::matmul::{GemmOperand, MatmulProvider, PointerTable};
use crate::tensor::Element;
use crate::weights::{AttentionWeights, ProjectionWeights};

/// Strategy chosen for a projection stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionPath {
    /// Three independent dense matmuls (or one, for the output stage)
    Dense,
    /// One batched call covering Q, K, and V
    Batched,
    /// Structured-sparse kernel over the encoded weights
    Sparse,
}

/// Row count rounded up to the sparse kernel's alignment unit
#[inline]
#[must_use]
pub fn padded_row_count(rows: usize) -> usize {
    rows.div_ceil(8) * 8
}

/// Choose the strategy for the Q/K/V projection stage
pub fn select_qkv_path<T, P>(
    provider: &P,
    sparsity_enabled: bool,
    weights: &AttentionWeights<T>,
    rows: usize,
    hidden: usize,
) -> ProjectionPath
where
    T: Element,
    P: MatmulProvider<T>,
{
    if sparsity_enabled
        && weights.qkv_sparse_ready()
        && provider.sparse_favorable(hidden, rows, hidden)
    {
        return ProjectionPath::Sparse;
    }
    if provider.batched_favorable(hidden, rows, hidden) {
        return ProjectionPath::Batched;
    }
    ProjectionPath::Dense
}

/// Choose the strategy for the output projection stage
pub fn select_output_path<T, P>(
    provider: &P,
    sparsity_enabled: bool,
    output: &ProjectionWeights<T>,
    rows: usize,
    hidden: usize,
) -> ProjectionPath
where
    T: Element,
    P: MatmulProvider<T>,
{
    if sparsity_enabled && output.has_sparse() && provider.sparse_favorable(hidden, rows, hidden) {
        ProjectionPath::Sparse
    } else {
        ProjectionPath::Dense
    }
}

/// Execute the Q/K/V projections along the chosen path
///
/// Raw (bias-free) projection outputs land in `q_out`, `k_out`, `v_out`;
/// the bias-fusion repack stage consumes them afterwards. The batched
/// path stages its operand table into `table` before the single call.
///
/// # Errors
///
/// Propagates provider failure; a [`ProjectionPath::Sparse`] request
/// without encoded weights is a dispatch bug and reported as such.
#[allow(clippy::too_many_arguments)]
pub fn run_qkv_projections<T, P>(
    provider: &P,
    path: ProjectionPath,
    weights: &AttentionWeights<T>,
    input: &[T],
    rows: usize,
    hidden: usize,
    q_out: &mut [T],
    k_out: &mut [T],
    v_out: &mut [T],
    table: &mut PointerTable,
) -> Result<()>
where
    T: Element,
    P: MatmulProvider<T>,
{
    match path {
        ProjectionPath::Dense => {
            for (w, out) in [
                (&weights.query, &mut *q_out),
                (&weights.key, &mut *k_out),
                (&weights.value, &mut *v_out),
            ] {
                provider.gemm_nt(rows, hidden, hidden, input, hidden, &w.dense, hidden, out, hidden)?;
            }
            Ok(())
        }
        ProjectionPath::Batched => {
            *table = PointerTable {
                m: rows,
                n: hidden,
                k: hidden,
                weights: [GemmOperand { offset: 0, ld: hidden }; 3],
                inputs: [GemmOperand { offset: 0, ld: hidden }; 3],
                outputs: [GemmOperand { offset: 0, ld: hidden }; 3],
            };
            provider.gemm_batched_nt(
                table,
                input,
                [
                    &weights.query.dense,
                    &weights.key.dense,
                    &weights.value.dense,
                ],
                [q_out, k_out, v_out],
            )
        }
        ProjectionPath::Sparse => {
            let padded = padded_row_count(rows);
            for (w, out) in [
                (&weights.query, &mut *q_out),
                (&weights.key, &mut *k_out),
                (&weights.value, &mut *v_out),
            ] {
                let sparse = w.sparse.as_ref().ok_or_else(|| AtenderError::Backend {
                    op: "qkv_projection",
                    reason: "sparse path chosen without encoded weights".to_string(),
                })?;
                provider.gemm_sparse_nt(rows, padded, hidden, hidden, sparse, input, out)?;
            }
            Ok(())
        }
    }
}

/// Execute the output projection along the chosen path
///
/// Writes `context * W^T + bias` into `out`, which is the caller-owned
/// output tensor. The bias epilogue runs in the element type.
///
/// # Errors
///
/// Propagates provider failure.
pub fn run_output_projection<T, P>(
    provider: &P,
    path: ProjectionPath,
    weights: &ProjectionWeights<T>,
    context: &[T],
    rows: usize,
    hidden: usize,
    out: &mut [T],
) -> Result<()>
where
    T: Element,
    P: MatmulProvider<T>,
{
    match path {
        ProjectionPath::Sparse => {
            let padded = padded_row_count(rows);
            let sparse = weights.sparse.as_ref().ok_or_else(|| AtenderError::Backend {
                op: "output_projection",
                reason: "sparse path chosen without encoded weights".to_string(),
            })?;
            provider.gemm_sparse_nt(rows, padded, hidden, hidden, sparse, context, out)?;
        }
        ProjectionPath::Dense | ProjectionPath::Batched => {
            provider.gemm_nt(
                rows,
                hidden,
                hidden,
                context,
                hidden,
                &weights.dense,
                hidden,
                out,
                hidden,
            )?;
        }
    }

    let bias = &weights.bias;
    out.par_chunks_mut(hidden).take(rows).for_each(|row| {
        for (o, b) in row.iter_mut().zip(bias) {
            *o = *o + *b;
        }
    });
    Ok(())
}
