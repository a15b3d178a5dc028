//! Fused attention layer orchestration
//!
//! [`FusedAttentionLayer`] ties the components together: the capacity
//! guard validates the call shape, the workspace lazily materializes the
//! scratch regions, the projection dispatcher computes Q/K/V, the
//! bias-fusion repack interleaves them, the fused attention dispatcher
//! runs the score kernel, and the output projection writes the result
//! into the caller-owned tensor.
//!
//! One layer instance owns one logical work queue: stages are issued in
//! program order and need no synchronization between them. Calls on the
//! same instance must be serialized by the caller while the workspace is
//! allocated; instances with their own buffers and queues are mutually
//! independent.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::backend::DeviceAllocator;
use crate::capacity::CapacityGuard;
use crate::error::{AtenderError, Result};
use crate::fmha::{FmhaDispatcher, FmhaRunArgs, SmArch};
use crate::matmul::MatmulProvider;
use crate::projection::{
    run_output_projection, run_qkv_projections, select_output_path, select_qkv_path,
};
use crate::repack::fused_bias_repack;
use crate::tensor::{Element, TensorView, TensorViewMut};
use crate::weights::AttentionWeights;
use crate::workspace::{AttentionWorkspace, WorkspaceStats};

/// Trace decisions when `ATENDER_VERBOSE` is set
fn verbose() -> bool {
    static VERBOSE: OnceLock<bool> = OnceLock::new();
    *VERBOSE.get_or_init(|| std::env::var("ATENDER_VERBOSE").is_ok())
}

/// Immutable construction-time configuration of one attention layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Maximum batch size; zero adopts the first observed value
    pub max_batch_size: usize,
    /// Maximum sequence length; zero adopts the first observed value
    pub max_seq_len: usize,
    /// Attention head count
    pub num_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// Deployed hardware generation
    pub arch: SmArch,
    /// Scaling factor applied to attention score dot products
    pub query_scale: f32,
    /// Release scratch regions at the end of every forward call
    #[serde(default)]
    pub release_after_call: bool,
    /// Allow the structured-sparse projection path
    #[serde(default)]
    pub sparsity_enabled: bool,
}

impl AttentionConfig {
    /// Hidden dimension implied by the head geometry
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Validate construction-time invariants
    ///
    /// # Errors
    ///
    /// Returns `Err` when the head geometry is degenerate or the scale
    /// is not finite.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.head_dim == 0 {
            return Err(AtenderError::InvalidConfig {
                reason: format!(
                    "head geometry {}x{} must be non-zero",
                    self.num_heads, self.head_dim
                ),
            });
        }
        if !self.query_scale.is_finite() {
            return Err(AtenderError::InvalidConfig {
                reason: format!("query scale {} is not finite", self.query_scale),
            });
        }
        Ok(())
    }
}

/// Fused multi-head self-attention forward engine
///
/// Generic over the element type, the matmul provider, and the device
/// allocator, which are the layer's external collaborators.
#[derive(Debug)]
pub struct FusedAttentionLayer<T, P, A>
where
    T: Element,
    P: MatmulProvider<T>,
    A: DeviceAllocator<T>,
{
    config: AttentionConfig,
    weights: AttentionWeights<T>,
    provider: P,
    allocator: A,
    dispatcher: FmhaDispatcher<T>,
    workspace: AttentionWorkspace<T>,
    guard: CapacityGuard,
}

impl<T, P, A> FusedAttentionLayer<T, P, A>
where
    T: Element,
    P: MatmulProvider<T>,
    A: DeviceAllocator<T>,
{
    /// Construct a layer, resolving the fused kernel for the deployed
    /// hardware
    ///
    /// # Errors
    ///
    /// Returns `Err` when the configuration is invalid, the weights do
    /// not match the configured hidden dimension, or no fused kernel
    /// exists for the (generation, head dimension) pair. All of these
    /// are permanent; the instance must not be used.
    pub fn new(
        config: AttentionConfig,
        weights: AttentionWeights<T>,
        provider: P,
        allocator: A,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_dim();
        if weights.query.out_dim != hidden || weights.query.in_dim != hidden {
            return Err(AtenderError::InvalidConfig {
                reason: format!(
                    "weights are [{}x{}], configuration implies [{hidden}x{hidden}]",
                    weights.query.out_dim, weights.query.in_dim
                ),
            });
        }
        let dispatcher = FmhaDispatcher::for_arch(config.arch, config.head_dim)?;
        if verbose() {
            eprintln!(
                "[atender] layer: {} heads x {} dim on {}, kernel {}",
                config.num_heads,
                config.head_dim,
                config.arch,
                dispatcher.kernel_name()
            );
        }
        let guard = CapacityGuard::new(config.max_batch_size, config.max_seq_len);
        Ok(Self {
            config,
            weights,
            provider,
            allocator,
            dispatcher,
            workspace: AttentionWorkspace::new(),
            guard,
        })
    }

    /// Layer configuration
    #[must_use]
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Name of the fused kernel selected at construction
    #[must_use]
    pub fn kernel_name(&self) -> &'static str {
        self.dispatcher.kernel_name()
    }

    /// Whether scratch regions are currently allocated
    #[must_use]
    pub fn workspace_allocated(&self) -> bool {
        self.workspace.is_allocated()
    }

    /// Scratch accounting snapshot
    #[must_use]
    pub fn workspace_stats(&self) -> WorkspaceStats {
        self.workspace.stats()
    }

    /// Explicitly release all scratch regions
    ///
    /// Idempotent; the next forward call re-allocates lazily.
    pub fn release_workspace(&mut self) {
        self.workspace.release(&mut self.allocator);
    }

    /// Run one attention forward pass
    ///
    /// `hidden_states` is `[token_count, hidden]`, `mask` is
    /// `[batch, 1, seq_len, seq_len]`, `padding_offsets` optionally maps
    /// compacted tokens back to sequence positions, and `output`
    /// receives `[token_count, hidden]`.
    ///
    /// The call returns once all work is issued in queue order. On any
    /// precondition failure nothing has been issued.
    ///
    /// # Errors
    ///
    /// Returns `Err` on shape violations, capacity violations (including
    /// the absolute 384-token ceiling), or collaborator failure.
    pub fn forward(
        &mut self,
        hidden_states: &TensorView<'_, T>,
        mask: &TensorView<'_, T>,
        padding_offsets: Option<&[i32]>,
        output: &mut TensorViewMut<'_, T>,
    ) -> Result<()> {
        let hidden = self.config.hidden_dim();

        // Shape validation before anything else
        if hidden_states.ndim() != 2 || hidden_states.dim(1) != hidden {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "hidden states shape {:?}, expected [tokens, {hidden}]",
                    hidden_states.shape()
                ),
            });
        }
        if mask.ndim() != 4 || mask.dim(1) != 1 || mask.dim(2) != mask.dim(3) {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "mask shape {:?}, expected [batch, 1, seq, seq]",
                    mask.shape()
                ),
            });
        }
        if output.shape() != hidden_states.shape() {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "output shape {:?} differs from input shape {:?}",
                    output.shape(),
                    hidden_states.shape()
                ),
            });
        }
        let batch = mask.dim(0);
        let seq_len = mask.dim(2);
        let token_count = hidden_states.dim(0);
        if padding_offsets.is_none() && token_count != batch * seq_len {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "token count {token_count} != batch {batch} * seq_len {seq_len} \
                     without padding offsets"
                ),
            });
        }
        if token_count > batch * seq_len {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "token count {token_count} exceeds batch {batch} * seq_len {seq_len}"
                ),
            });
        }

        // Capacity guarding runs before any allocation or compute
        self.guard.check_batch_size(batch)?;
        self.guard.check_seq_len(seq_len)?;

        // Both bounds are pinned after the checks above
        let max_batch = self.guard.max_batch_size().unwrap_or(batch);
        let max_seq = self.guard.max_seq_len().unwrap_or(seq_len);
        self.workspace.ensure_allocated(
            &mut self.allocator,
            max_batch,
            max_seq,
            hidden,
            self.dispatcher.workspace_len(),
        )?;

        // Q/K/V projections into the per-projection scratch regions
        let qkv_path = select_qkv_path(
            &self.provider,
            self.config.sparsity_enabled,
            &self.weights,
            token_count,
            hidden,
        );
        if verbose() {
            eprintln!(
                "[atender] forward: batch={batch} seq={seq_len} tokens={token_count} \
                 qkv_path={qkv_path:?}"
            );
        }
        {
            let q_buf = self.workspace.q_buf.as_mut().expect("workspace allocated");
            let k_buf = self.workspace.k_buf.as_mut().expect("workspace allocated");
            let v_buf = self.workspace.v_buf.as_mut().expect("workspace allocated");
            let table = self
                .workspace
                .pointer_table
                .as_mut()
                .expect("workspace allocated");
            run_qkv_projections(
                &self.provider,
                qkv_path,
                &self.weights,
                hidden_states.as_slice(),
                token_count,
                hidden,
                q_buf.as_mut_slice(),
                k_buf.as_mut_slice(),
                v_buf.as_mut_slice(),
                table,
            )?;
        }

        // Bias fusion + interleave into the fused region
        {
            let q_buf = self.workspace.q_buf.as_ref().expect("workspace allocated");
            let k_buf = self.workspace.k_buf.as_ref().expect("workspace allocated");
            let v_buf = self.workspace.v_buf.as_ref().expect("workspace allocated");
            let fused = self
                .workspace
                .fused_buf
                .as_mut()
                .expect("workspace allocated");
            fused_bias_repack(
                q_buf.as_slice(),
                k_buf.as_slice(),
                v_buf.as_slice(),
                &self.weights.query.bias,
                &self.weights.key.bias,
                &self.weights.value.bias,
                fused.as_mut_slice(),
                token_count,
                self.config.num_heads,
                self.config.head_dim,
            )?;
        }

        // Fused attention kernel into the context region
        self.dispatcher.configure(seq_len, batch)?;
        {
            let fused = self
                .workspace
                .fused_buf
                .as_ref()
                .expect("workspace allocated");
            let kernel_ws = self
                .workspace
                .kernel_buf
                .as_mut()
                .expect("workspace allocated");
            let context = self
                .workspace
                .context_buf
                .as_mut()
                .expect("workspace allocated");
            self.dispatcher.run(&mut FmhaRunArgs {
                fused: fused.as_slice(),
                mask: mask.as_slice(),
                padding_offsets,
                workspace: kernel_ws.as_mut_slice(),
                output: context.as_mut_slice(),
                batch,
                seq_len,
                token_count,
                num_heads: self.config.num_heads,
                head_dim: self.config.head_dim,
                scale: self.config.query_scale,
            })?;
        }

        // Output projection into the caller-owned tensor
        let out_path = select_output_path(
            &self.provider,
            self.config.sparsity_enabled,
            &self.weights.output,
            token_count,
            hidden,
        );
        {
            let context = self
                .workspace
                .context_buf
                .as_ref()
                .expect("workspace allocated");
            run_output_projection(
                &self.provider,
                out_path,
                &self.weights.output,
                context.as_slice(),
                token_count,
                hidden,
                output.as_mut_slice(),
            )?;
        }

        if self.config.release_after_call {
            self.workspace.release(&mut self.allocator);
        }
        Ok(())
    }
}

impl<T, P, A> Drop for FusedAttentionLayer<T, P, A>
where
    T: Element,
    P: MatmulProvider<T>,
    A: DeviceAllocator<T>,
{
    fn drop(&mut self) {
        self.workspace.release(&mut self.allocator);
    }
}
