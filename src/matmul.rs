//! Matmul provider collaborator contract
//!
//! The engine chooses among three multiply strategies per projection but
//! never implements the multiply algorithm itself. [`MatmulProvider`] is
//! the fixed call contract: dense, batched (one call covering the three
//! Q/K/V projections), and structured-sparse, plus the pure eligibility
//! queries the dispatcher consults. [`HostProvider`] is the reference
//! implementation used as the default backend and by every test.
//!
//! All operations are `output = input * weight^T` with row-major operands
//! and explicit leading dimensions. The provider fails fatally on
//! malformed shapes; nothing here is retried.

use rayon::prelude::*;

use crate::error::{AtenderError, Result};
use crate::sparse::SparseWeight;
use crate::tensor::Element;

/// One operand slot of the batched-projection staging table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GemmOperand {
    /// Element offset of the operand within its buffer
    pub offset: usize,
    /// Leading dimension (row stride in elements)
    pub ld: usize,
}

/// Staging table for the batched Q/K/V projection
///
/// Three explicitly-sized sub-tables describe the weight, input, and
/// output operands of the three fused matmuls. The projection dispatcher
/// assembles the table host-side and stages it into the workspace's
/// pointer-table region before issuing the single batched call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerTable {
    /// Rows of each output (tokens)
    pub m: usize,
    /// Columns of each output (output channels)
    pub n: usize,
    /// Reduction dimension (input channels)
    pub k: usize,
    /// Weight operands for {query, key, value}
    pub weights: [GemmOperand; 3],
    /// Input operands for {query, key, value}; all three reference the
    /// same token embeddings
    pub inputs: [GemmOperand; 3],
    /// Output operands for {query, key, value}
    pub outputs: [GemmOperand; 3],
}

/// Fixed call contract of the external matmul provider
pub trait MatmulProvider<T: Element>: Send {
    /// Dense `C[m,n] = A[m,k] * B[n,k]^T`
    ///
    /// `a` is `[m, k]` with leading dimension `lda`, `b` is the weight
    /// `[n, k]` with leading dimension `ldb`, `c` is `[m, n]` with leading
    /// dimension `ldc`.
    ///
    /// # Errors
    ///
    /// Returns `Err` on any operand/shape mismatch. Shape faults are
    /// fatal for the call; this layer never retries them.
    #[allow(clippy::too_many_arguments)]
    fn gemm_nt(
        &self,
        m: usize,
        n: usize,
        k: usize,
        a: &[T],
        lda: usize,
        b: &[T],
        ldb: usize,
        c: &mut [T],
        ldc: usize,
    ) -> Result<()>;

    /// One batched call covering the three Q/K/V projections
    ///
    /// Operand geometry comes from the staged `table`; `input` is shared
    /// by all three matmuls, `weights` and `outputs` are per-projection.
    ///
    /// # Errors
    ///
    /// Returns `Err` on any operand/shape mismatch.
    fn gemm_batched_nt(
        &self,
        table: &PointerTable,
        input: &[T],
        weights: [&[T]; 3],
        outputs: [&mut [T]; 3],
    ) -> Result<()>;

    /// Structured-sparse `C[m,n] = A[m,k] * W^T` over an encoded weight
    ///
    /// `m_padded` is the alignment row count the sparse kernel is sized
    /// for: at least `m`, rounded up to a multiple of 8. Rows past `m`
    /// are alignment ghosts; the provider must not read input rows or
    /// write output rows beyond `m`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `m_padded` violates the alignment contract or on
    /// any operand/shape mismatch.
    #[allow(clippy::too_many_arguments)]
    fn gemm_sparse_nt(
        &self,
        m: usize,
        m_padded: usize,
        n: usize,
        k: usize,
        weight: &SparseWeight<T>,
        a: &[T],
        c: &mut [T],
    ) -> Result<()>;

    /// Whether fusing the three Q/K/V matmuls into one batched call is
    /// favorable for `(out_dim, rows, in_dim)`. Pure query, no side
    /// effects.
    fn batched_favorable(&self, out_dim: usize, rows: usize, in_dim: usize) -> bool;

    /// Whether the structured-sparse kernel is favorable for
    /// `(out_dim, rows, in_dim)`. Pure query, no side effects.
    fn sparse_favorable(&self, out_dim: usize, rows: usize, in_dim: usize) -> bool;
}

/// Host reference implementation of the provider contract
///
/// Accumulates in `f32` and rounds once into the element type, which is
/// the accumulate-wide/store-narrow behavior of the device kernels this
/// stands in for. Eligibility thresholds are constructor-tunable so tests
/// can pin a specific path.
#[derive(Debug, Clone)]
pub struct HostProvider {
    batched_min_rows: usize,
    sparse_dim_multiple: usize,
}

impl Default for HostProvider {
    fn default() -> Self {
        Self {
            batched_min_rows: 4,
            sparse_dim_multiple: 16,
        }
    }
}

impl HostProvider {
    /// Provider with default eligibility thresholds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum row count before the batched path is reported favorable.
    /// `usize::MAX` disables the batched path entirely.
    #[must_use]
    pub fn with_batched_min_rows(mut self, rows: usize) -> Self {
        self.batched_min_rows = rows;
        self
    }

    /// Dimension multiple the sparse kernel requires. Both `out_dim` and
    /// `in_dim` must divide by it.
    #[must_use]
    pub fn with_sparse_dim_multiple(mut self, multiple: usize) -> Self {
        self.sparse_dim_multiple = multiple;
        self
    }
}

fn check_operand(name: &'static str, len: usize, rows: usize, ld: usize, row_len: usize) -> Result<()> {
    if ld < row_len {
        return Err(AtenderError::Backend {
            op: "gemm_nt",
            reason: format!("{name}: leading dimension {ld} < row length {row_len}"),
        });
    }
    let needed = if rows == 0 { 0 } else { (rows - 1) * ld + row_len };
    if len < needed {
        return Err(AtenderError::Backend {
            op: "gemm_nt",
            reason: format!("{name}: buffer holds {len} elements, operation needs {needed}"),
        });
    }
    Ok(())
}

impl<T: Element> MatmulProvider<T> for HostProvider {
    fn gemm_nt(
        &self,
        m: usize,
        n: usize,
        k: usize,
        a: &[T],
        lda: usize,
        b: &[T],
        ldb: usize,
        c: &mut [T],
        ldc: usize,
    ) -> Result<()> {
        check_operand("A", a.len(), m, lda, k)?;
        check_operand("B", b.len(), n, ldb, k)?;
        check_operand("C", c.len(), m, ldc, n)?;

        c.par_chunks_mut(ldc).take(m).enumerate().for_each(|(i, row)| {
            let a_row = &a[i * lda..i * lda + k];
            for (j, out) in row.iter_mut().take(n).enumerate() {
                let b_row = &b[j * ldb..j * ldb + k];
                let mut acc = 0.0f32;
                for (x, w) in a_row.iter().zip(b_row) {
                    acc += x.to_f32() * w.to_f32();
                }
                *out = T::from_f32(acc);
            }
        });
        Ok(())
    }

    fn gemm_batched_nt(
        &self,
        table: &PointerTable,
        input: &[T],
        weights: [&[T]; 3],
        outputs: [&mut [T]; 3],
    ) -> Result<()> {
        let (m, n, k) = (table.m, table.n, table.k);
        for ((w, out), idx) in weights.into_iter().zip(outputs).zip(0..3usize) {
            let a_off = table.inputs[idx].offset;
            let w_off = table.weights[idx].offset;
            let c_off = table.outputs[idx].offset;
            self.gemm_nt(
                m,
                n,
                k,
                &input[a_off..],
                table.inputs[idx].ld,
                &w[w_off..],
                table.weights[idx].ld,
                &mut out[c_off..],
                table.outputs[idx].ld,
            )?;
        }
        Ok(())
    }

    fn gemm_sparse_nt(
        &self,
        m: usize,
        m_padded: usize,
        n: usize,
        k: usize,
        weight: &SparseWeight<T>,
        a: &[T],
        c: &mut [T],
    ) -> Result<()> {
        if m_padded < m || m_padded % 8 != 0 {
            return Err(AtenderError::Backend {
                op: "gemm_sparse_nt",
                reason: format!("padded row count {m_padded} invalid for {m} logical rows"),
            });
        }
        if weight.rows != n || weight.cols != k {
            return Err(AtenderError::Backend {
                op: "gemm_sparse_nt",
                reason: format!(
                    "sparse weight is [{}x{}], operation needs [{n}x{k}]",
                    weight.rows, weight.cols
                ),
            });
        }
        check_operand("A", a.len(), m, k, k)?;
        check_operand("C", c.len(), m, n, n)?;

        c.par_chunks_mut(n).take(m).enumerate().for_each(|(i, row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for (j, out) in row.iter_mut().enumerate() {
                *out = T::from_f32(weight.row_dot(j, a_row));
            }
        });
        Ok(())
    }

    fn batched_favorable(&self, _out_dim: usize, rows: usize, _in_dim: usize) -> bool {
        // Fusing three launches only pays off once there are enough rows
        // to amortize the staging copy.
        rows >= self.batched_min_rows
    }

    fn sparse_favorable(&self, out_dim: usize, rows: usize, in_dim: usize) -> bool {
        rows > 0
            && self.sparse_dim_multiple > 0
            && out_dim % self.sparse_dim_multiple == 0
            && in_dim % self.sparse_dim_multiple == 0
    }
}
