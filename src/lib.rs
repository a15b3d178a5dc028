//! # Atender
//!
//! Fused multi-head self-attention forward engine with runtime kernel
//! dispatch.
//!
//! Atender (Spanish: "to attend") computes the forward pass of a fused
//! attention layer for transformer inference: given token embeddings and
//! an attention mask it produces the attention output with minimal host
//! overhead and scratch footprint, by fusing bias addition, layout
//! repacking, and score computation, and by choosing the fastest
//! matrix-multiply strategy per projection at run time.
//!
//! ## Features
//!
//! - **Lazy scratch workspace**: six named regions sized once from the
//!   layer configuration, reused across calls, released on request
//! - **Projection dispatch**: dense, batched (one call for Q/K/V), and
//!   structured-sparse paths selected by eligibility queries
//! - **Bias-fusion repack**: one pass replaces three bias-adds and a
//!   layout transpose
//! - **Hardware-generation dispatch**: the fused score kernel is resolved
//!   once at construction from (generation, head dimension)
//! - **Capacity guarding**: adopt-on-first-use batch/sequence bounds with
//!   an absolute 384-token tile ceiling
//!
//! ## Example
//!
//! ```rust
//! use atender::{
//!     AttentionConfig, AttentionWeights, FusedAttentionLayer, HostProvider,
//!     ProjectionWeights, SmArch, SystemAllocator, TensorView, TensorViewMut,
//! };
//!
//! let hidden = 8;
//! let identity = |_: ()| {
//!     let mut w = vec![0.0f32; hidden * hidden];
//!     for i in 0..hidden {
//!         w[i * hidden + i] = 1.0;
//!     }
//!     ProjectionWeights::new(w, vec![0.0; hidden], hidden, hidden).unwrap()
//! };
//! let weights = AttentionWeights::new(
//!     identity(()), identity(()), identity(()), identity(()), hidden,
//! ).unwrap();
//!
//! let config = AttentionConfig {
//!     max_batch_size: 1,
//!     max_seq_len: 8,
//!     num_heads: 2,
//!     head_dim: 4,
//!     arch: SmArch::Ampere,
//!     query_scale: 0.5,
//!     release_after_call: false,
//!     sparsity_enabled: false,
//! };
//! let mut layer = FusedAttentionLayer::new(
//!     config, weights, HostProvider::new(), SystemAllocator::new(),
//! ).unwrap();
//!
//! let x = vec![0.1f32; 8 * hidden];
//! let mask = vec![1.0f32; 8 * 8];
//! let mut out = vec![0.0f32; 8 * hidden];
//! let xs = TensorView::new(&x, &[8, hidden]).unwrap();
//! let mv = TensorView::new(&mask, &[1, 1, 8, 8]).unwrap();
//! let mut ov = TensorViewMut::new(&mut out, &[8, hidden]).unwrap();
//! layer.forward(&xs, &mv, None, &mut ov).unwrap();
//! assert!(out.iter().all(|v| v.is_finite()));
//! ```
//!
//! ## Architecture
//!
//! The layer orchestrates three external collaborators behind fixed call
//! contracts: the matmul provider ([`MatmulProvider`]), the device
//! allocator ([`DeviceAllocator`]), and the specialized fused attention
//! kernels ([`FmhaKernel`]). [`HostProvider`] and [`SystemAllocator`]
//! are the host reference implementations, which keep every dispatch
//! path testable without accelerator hardware.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for scores is fine
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)] // offsets are validated non-negative first
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]

pub mod backend;
pub mod capacity;
pub mod error;
pub mod fmha;
pub mod matmul;
pub mod projection;
pub mod repack;
pub mod sparse;
pub mod tensor;
pub mod weights;
pub mod workspace;

mod layer;

pub use backend::{AllocatorStats, DeviceAllocator, DeviceBuffer, SystemAllocator};
pub use capacity::{Capacity, CapacityGuard, MAX_SEQ_LEN};
pub use error::{AtenderError, Result};
pub use fmha::{DispatchState, FmhaDispatcher, FmhaKernel, FmhaRunArgs, SmArch, TileClass};
pub use layer::{AttentionConfig, FusedAttentionLayer};
pub use matmul::{GemmOperand, HostProvider, MatmulProvider, PointerTable};
pub use projection::{padded_row_count, ProjectionPath};
pub use repack::fused_bias_repack;
pub use sparse::{prune_2of4, SparseWeight};
pub use tensor::{Element, TensorView, TensorViewMut};
pub use weights::{AttentionWeights, ProjectionWeights};
pub use workspace::{AttentionWorkspace, WorkspaceStats};
