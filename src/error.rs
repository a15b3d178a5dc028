//! Error types for the attention engine
//!
//! All fallible operations return [`Result`], an alias over [`AtenderError`].
//! The taxonomy mirrors the failure classes of the layer:
//! - Configuration errors are permanent: the instance must not be used.
//! - Capacity violations abort the current call before any work is issued.
//! - Collaborator failures (matmul provider, attention kernel, allocator)
//!   propagate unchanged; this layer performs no retries.

use thiserror::Error;

/// Error type for all attention-engine operations
#[derive(Debug, Error)]
pub enum AtenderError {
    /// No fused attention kernel exists for the hardware generation and
    /// per-head dimension. Raised at construction, never at invocation.
    #[error("No fused attention kernel for {arch} with head_dim {head_dim}")]
    UnsupportedArch {
        /// Hardware generation that was requested
        arch: String,
        /// Per-head dimension that was requested
        head_dim: usize,
    },

    /// The selected kernel does not support the tile class covering the
    /// requested sequence length. Tile support is static, so this surfaces
    /// a deployment misconfiguration rather than bad request data.
    #[error("Kernel {kernel} has no tile class covering seq_len {seq_len}")]
    UnsupportedTileClass {
        /// Name of the selected kernel
        kernel: String,
        /// Sequence length that could not be covered
        seq_len: usize,
    },

    /// Batch size or sequence length exceeds the layer's fixed capacity
    #[error("{what} {requested} exceeds limit {limit}")]
    CapacityExceeded {
        /// Which bound was violated ("batch_size" or "seq_len")
        what: &'static str,
        /// Value the caller requested
        requested: usize,
        /// Hard limit in effect
        limit: usize,
    },

    /// Invalid tensor or configuration shape
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Explanation of the violation
        reason: String,
    },

    /// Data size doesn't match the declared shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual number of elements supplied
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Element count the shape implies
        expected: usize,
    },

    /// Invalid layer configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Explanation of the violation
        reason: String,
    },

    /// A collaborator (matmul provider, attention kernel, allocator)
    /// reported a device-level failure
    #[error("Backend failure in {op}: {reason}")]
    Backend {
        /// Operation that failed
        op: &'static str,
        /// Collaborator-reported reason
        reason: String,
    },
}

/// Result type alias for attention-engine operations
pub type Result<T> = std::result::Result<T, AtenderError>;
