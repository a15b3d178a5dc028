//! Projection weight storage
//!
//! Each of the four projections {query, key, value, output} carries a dense
//! weight matrix, a bias vector, and optionally a structured-sparse
//! encoding of the same matrix. The sparse encoding, when present, is an
//! alternate representation: decoding it must reproduce the dense weights.

use crate::error::{AtenderError, Result};
use crate::sparse::SparseWeight;
use crate::tensor::Element;

/// Weights for one linear projection: `y = x * W^T + b`
///
/// `dense` is row-major `[out_dim, in_dim]`; `bias` has `out_dim` entries.
#[derive(Debug, Clone)]
pub struct ProjectionWeights<T: Element> {
    /// Dense weight matrix, row-major `[out_dim, in_dim]`
    pub dense: Vec<T>,
    /// Per-channel bias, `out_dim` entries
    pub bias: Vec<T>,
    /// Optional structured-sparse encoding of `dense`
    pub sparse: Option<SparseWeight<T>>,
    /// Output channels
    pub out_dim: usize,
    /// Input channels
    pub in_dim: usize,
}

impl<T: Element> ProjectionWeights<T> {
    /// Create dense-only projection weights
    ///
    /// # Errors
    ///
    /// Returns `Err` if the weight or bias length doesn't match the
    /// declared dimensions.
    pub fn new(dense: Vec<T>, bias: Vec<T>, out_dim: usize, in_dim: usize) -> Result<Self> {
        if dense.len() != out_dim * in_dim {
            return Err(AtenderError::DataShapeMismatch {
                data_size: dense.len(),
                shape: vec![out_dim, in_dim],
                expected: out_dim * in_dim,
            });
        }
        if bias.len() != out_dim {
            return Err(AtenderError::DataShapeMismatch {
                data_size: bias.len(),
                shape: vec![out_dim],
                expected: out_dim,
            });
        }
        Ok(Self {
            dense,
            bias,
            sparse: None,
            out_dim,
            in_dim,
        })
    }

    /// Attach a structured-sparse encoding of the dense matrix
    ///
    /// # Errors
    ///
    /// Returns `Err` if the dense matrix does not satisfy the 2:4 pattern
    /// or its columns are not group-aligned.
    pub fn with_sparse_encoding(mut self) -> Result<Self> {
        let sparse = SparseWeight::encode(&self.dense, self.out_dim, self.in_dim)?;
        self.sparse = Some(sparse);
        Ok(self)
    }

    /// Whether a sparse encoding is attached
    #[must_use]
    pub fn has_sparse(&self) -> bool {
        self.sparse.is_some()
    }
}

/// The full weight set of one attention layer
#[derive(Debug, Clone)]
pub struct AttentionWeights<T: Element> {
    /// Query projection, `[hidden, hidden]`
    pub query: ProjectionWeights<T>,
    /// Key projection, `[hidden, hidden]`
    pub key: ProjectionWeights<T>,
    /// Value projection, `[hidden, hidden]`
    pub value: ProjectionWeights<T>,
    /// Output projection, `[hidden, hidden]`
    pub output: ProjectionWeights<T>,
}

impl<T: Element> AttentionWeights<T> {
    /// Bundle the four projections, validating they agree on `hidden_dim`
    ///
    /// # Errors
    ///
    /// Returns `Err` if any projection is not square `[hidden, hidden]`
    /// for the shared hidden dimension.
    pub fn new(
        query: ProjectionWeights<T>,
        key: ProjectionWeights<T>,
        value: ProjectionWeights<T>,
        output: ProjectionWeights<T>,
        hidden_dim: usize,
    ) -> Result<Self> {
        for (name, p) in [
            ("query", &query),
            ("key", &key),
            ("value", &value),
            ("output", &output),
        ] {
            if p.out_dim != hidden_dim || p.in_dim != hidden_dim {
                return Err(AtenderError::InvalidShape {
                    reason: format!(
                        "{name} projection is [{}x{}], expected [{hidden_dim}x{hidden_dim}]",
                        p.out_dim, p.in_dim
                    ),
                });
            }
        }
        Ok(Self {
            query,
            key,
            value,
            output,
        })
    }

    /// Whether all three input projections carry sparse encodings
    #[must_use]
    pub fn qkv_sparse_ready(&self) -> bool {
        self.query.has_sparse() && self.key.has_sparse() && self.value.has_sparse()
    }
}
