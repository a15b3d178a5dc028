//! Fused attention kernel dispatch
//!
//! Specialized fused attention-score kernels are compiled per hardware
//! generation and tuned per sequence-length tile class. This module owns
//! the selection logic:
//!
//! - [`SmArch`]: the hardware generation identifier.
//! - [`TileClass`]: the discrete sequence-length buckets kernels are
//!   tuned for.
//! - [`FmhaKernel`]: the fixed invocation contract of one kernel.
//! - [`FmhaDispatcher`]: owns the kernel chosen at construction and walks
//!   the Unconfigured / Configured / Running states per forward call.
//!
//! The kernel is resolved exactly once, at layer construction, from the
//! (generation, head dimension) pair. An unsupported combination fails
//! construction, never invocation: it reflects the deployed hardware,
//! not request data. Tile-class support is static per kernel, so a
//! sequence length whose tile the kernel lacks surfaces a deployment
//! misconfiguration.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{AtenderError, Result};
use crate::repack::{fused_offset, fused_token_stride};
use crate::tensor::Element;

// ---------------------------------------------------------------------------
// Hardware generations
// ---------------------------------------------------------------------------

/// Hardware generation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmArch {
    /// sm_75
    Turing,
    /// sm_80 / sm_86 / sm_87
    Ampere,
    /// sm_89
    Ada,
    /// sm_90
    Hopper,
}

impl SmArch {
    /// Numeric SM identifier of the generation's baseline
    #[must_use]
    pub fn sm_id(&self) -> u32 {
        match self {
            SmArch::Turing => 75,
            SmArch::Ampere => 80,
            SmArch::Ada => 89,
            SmArch::Hopper => 90,
        }
    }

    /// Map a raw SM identifier onto a supported generation
    #[must_use]
    pub fn from_sm(sm: u32) -> Option<Self> {
        match sm {
            75 => Some(SmArch::Turing),
            80 | 86 | 87 => Some(SmArch::Ampere),
            89 => Some(SmArch::Ada),
            90 => Some(SmArch::Hopper),
            _ => None,
        }
    }
}

impl fmt::Display for SmArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm_{}", self.sm_id())
    }
}

// ---------------------------------------------------------------------------
// Tile classes
// ---------------------------------------------------------------------------

/// Sequence-length bucket a fused kernel is tuned for
///
/// A call's actual sequence length maps to the smallest class that covers
/// it. 384 is the largest class any kernel supports; the capacity guard
/// enforces it as an absolute ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TileClass {
    /// Sequences up to 32 tokens
    S32,
    /// Sequences up to 64 tokens
    S64,
    /// Sequences up to 96 tokens
    S96,
    /// Sequences up to 128 tokens
    S128,
    /// Sequences up to 192 tokens
    S192,
    /// Sequences up to 256 tokens
    S256,
    /// Sequences up to 384 tokens
    S384,
}

impl TileClass {
    /// All classes, smallest first
    pub const ALL: [TileClass; 7] = [
        TileClass::S32,
        TileClass::S64,
        TileClass::S96,
        TileClass::S128,
        TileClass::S192,
        TileClass::S256,
        TileClass::S384,
    ];

    /// Upper sequence length of this class
    #[must_use]
    pub fn seq_len(&self) -> usize {
        match self {
            TileClass::S32 => 32,
            TileClass::S64 => 64,
            TileClass::S96 => 96,
            TileClass::S128 => 128,
            TileClass::S192 => 192,
            TileClass::S256 => 256,
            TileClass::S384 => 384,
        }
    }

    /// Smallest class covering `seq_len`, if any
    #[must_use]
    pub fn covering(seq_len: usize) -> Option<TileClass> {
        TileClass::ALL.into_iter().find(|t| t.seq_len() >= seq_len)
    }
}

// ---------------------------------------------------------------------------
// Kernel capability table
// ---------------------------------------------------------------------------

/// Static capabilities of one compiled kernel variant
#[derive(Debug, Clone, Copy)]
struct KernelSpec {
    name: &'static str,
    min_sm: u32,
    max_head_dim: usize,
    tiles: &'static [TileClass],
}

const TILES_THROUGH_256: &[TileClass] = &[
    TileClass::S32,
    TileClass::S64,
    TileClass::S96,
    TileClass::S128,
    TileClass::S192,
    TileClass::S256,
];

const TILES_ALL: &[TileClass] = &TileClass::ALL;

/// Kernel variants, newest generation first. Selection picks the first
/// entry the deployed generation and head dimension satisfy.
const KERNEL_TABLE: &[KernelSpec] = &[
    KernelSpec {
        name: "fmha_hopper",
        min_sm: 90,
        max_head_dim: 128,
        tiles: TILES_ALL,
    },
    KernelSpec {
        name: "fmha_ampere",
        min_sm: 80,
        max_head_dim: 128,
        tiles: TILES_ALL,
    },
    KernelSpec {
        name: "fmha_turing",
        min_sm: 75,
        max_head_dim: 64,
        tiles: TILES_THROUGH_256,
    },
];

fn select_kernel_spec(arch: SmArch, head_dim: usize) -> Option<&'static KernelSpec> {
    KERNEL_TABLE
        .iter()
        .find(|spec| arch.sm_id() >= spec.min_sm && head_dim <= spec.max_head_dim)
}

// ---------------------------------------------------------------------------
// Kernel contract
// ---------------------------------------------------------------------------

/// Buffer contract of one fused attention kernel invocation
#[derive(Debug)]
pub struct FmhaRunArgs<'a, T: Element> {
    /// Bias-fused interleaved Q/K/V, `[tokens, heads, 3, head_dim]`
    pub fused: &'a [T],
    /// Attention mask, `[batch, 1, seq_len, seq_len]`; zero excludes a
    /// position, non-zero admits it
    pub mask: &'a [T],
    /// Cumulative token offsets when padding is removed, `[batch + 1]`
    /// entries (a `[2 * batch + 1]` table is accepted; only the leading
    /// `batch + 1` entries are consulted). `None` means no compaction.
    pub padding_offsets: Option<&'a [i32]>,
    /// Kernel workspace region
    pub workspace: &'a mut [T],
    /// Attention output, `[tokens, heads * head_dim]`
    pub output: &'a mut [T],
    /// Batch size of this call
    pub batch: usize,
    /// Padded sequence length of this call
    pub seq_len: usize,
    /// Total tokens in `fused` and `output`
    pub token_count: usize,
    /// Head count
    pub num_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// Query scaling factor applied to the score dot products
    pub scale: f32,
}

/// Fixed contract of a specialized fused attention kernel
///
/// `configure` pins the kernel to a (tile class, batch) pair; `run`
/// enqueues one attention pass. Capability and workspace queries are
/// static per kernel.
pub trait FmhaKernel<T: Element>: Send + fmt::Debug {
    /// Kernel variant name
    fn name(&self) -> &'static str;

    /// Whether this kernel was compiled for `tile`
    fn supports_tile(&self, tile: TileClass) -> bool;

    /// Workspace elements the kernel requires
    fn workspace_len(&self) -> usize;

    /// Pin the kernel to a tile class and batch size
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tile is unsupported.
    fn configure(&mut self, tile: TileClass, batch: usize) -> Result<()>;

    /// Enqueue one attention pass over the fused buffer
    ///
    /// # Errors
    ///
    /// Returns `Err` on buffer-contract violations or device failure.
    fn run(&mut self, args: &mut FmhaRunArgs<'_, T>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Host reference kernel
// ---------------------------------------------------------------------------

/// Host implementation of the fused attention kernel contract
///
/// Computes softmax(scale * Q K^T, masked) V per (sequence, head) from
/// the interleaved fused buffer. Scores and the context accumulation run
/// in `f32`, which mirrors the wide-accumulator behavior of the device
/// kernels; the context rounds once into `T` on store. Per-token score
/// rows live in thread-local storage, so the workspace region is only
/// capacity-checked here.
#[derive(Debug)]
pub struct HostFmhaKernel {
    spec: &'static KernelSpec,
    configured: Option<(TileClass, usize)>,
}

impl HostFmhaKernel {
    fn from_spec(spec: &'static KernelSpec) -> Self {
        Self {
            spec,
            configured: None,
        }
    }
}

/// Resolve the token span of every sequence in the batch
///
/// Returns `(start, len)` per sequence. With padding offsets the spans
/// come from the cumulative table; without, every sequence spans exactly
/// `seq_len` tokens.
fn sequence_spans(
    batch: usize,
    seq_len: usize,
    token_count: usize,
    padding_offsets: Option<&[i32]>,
) -> Result<Vec<(usize, usize)>> {
    match padding_offsets {
        None => {
            if token_count != batch * seq_len {
                return Err(AtenderError::InvalidShape {
                    reason: format!(
                        "token count {token_count} != batch {batch} * seq_len {seq_len} \
                         without padding offsets"
                    ),
                });
            }
            Ok((0..batch).map(|b| (b * seq_len, seq_len)).collect())
        }
        Some(offsets) => {
            if offsets.len() != batch + 1 && offsets.len() != 2 * batch + 1 {
                return Err(AtenderError::InvalidShape {
                    reason: format!(
                        "padding offsets hold {} entries, expected {} or {}",
                        offsets.len(),
                        batch + 1,
                        2 * batch + 1
                    ),
                });
            }
            let mut spans = Vec::with_capacity(batch);
            for b in 0..batch {
                let start = offsets[b];
                let end = offsets[b + 1];
                if start < 0 || end < start {
                    return Err(AtenderError::InvalidShape {
                        reason: format!("padding offsets not monotonic at sequence {b}"),
                    });
                }
                let len = (end - start) as usize;
                if len > seq_len {
                    return Err(AtenderError::InvalidShape {
                        reason: format!("sequence {b} has {len} tokens, mask covers {seq_len}"),
                    });
                }
                spans.push((start as usize, len));
            }
            if offsets[batch] as usize != token_count {
                return Err(AtenderError::InvalidShape {
                    reason: format!(
                        "padding offsets account for {} tokens, fused buffer holds {token_count}",
                        offsets[batch]
                    ),
                });
            }
            Ok(spans)
        }
    }
}

impl<T: Element> FmhaKernel<T> for HostFmhaKernel {
    fn name(&self) -> &'static str {
        self.spec.name
    }

    fn supports_tile(&self, tile: TileClass) -> bool {
        self.spec.tiles.contains(&tile)
    }

    fn workspace_len(&self) -> usize {
        // Sized for the largest tile this kernel was compiled for: one
        // full score matrix.
        let max_tile = self.spec.tiles.iter().map(|t| t.seq_len()).max().unwrap_or(0);
        max_tile * max_tile
    }

    fn configure(&mut self, tile: TileClass, batch: usize) -> Result<()> {
        if !<Self as FmhaKernel<T>>::supports_tile(self, tile) {
            return Err(AtenderError::UnsupportedTileClass {
                kernel: self.spec.name.to_string(),
                seq_len: tile.seq_len(),
            });
        }
        self.configured = Some((tile, batch));
        Ok(())
    }

    fn run(&mut self, args: &mut FmhaRunArgs<'_, T>) -> Result<()> {
        let Some((tile, batch)) = self.configured else {
            return Err(AtenderError::Backend {
                op: "fmha_run",
                reason: "kernel run before configure".to_string(),
            });
        };
        if batch != args.batch || tile.seq_len() < args.seq_len {
            return Err(AtenderError::Backend {
                op: "fmha_run",
                reason: format!(
                    "configured for (tile {}, batch {batch}), run asked ({}, {})",
                    tile.seq_len(),
                    args.seq_len,
                    args.batch
                ),
            });
        }
        let hidden = args.num_heads * args.head_dim;
        let stride = fused_token_stride(args.num_heads, args.head_dim);
        if args.fused.len() < args.token_count * stride {
            return Err(AtenderError::Backend {
                op: "fmha_run",
                reason: "fused buffer shorter than token count requires".to_string(),
            });
        }
        if args.mask.len() != args.batch * args.seq_len * args.seq_len {
            return Err(AtenderError::Backend {
                op: "fmha_run",
                reason: format!(
                    "mask holds {} elements, expected batch*seq*seq = {}",
                    args.mask.len(),
                    args.batch * args.seq_len * args.seq_len
                ),
            });
        }
        if args.workspace.len() < args.seq_len * args.seq_len {
            return Err(AtenderError::Backend {
                op: "fmha_run",
                reason: "kernel workspace under capacity".to_string(),
            });
        }

        let spans = sequence_spans(args.batch, args.seq_len, args.token_count, args.padding_offsets)?;
        let mut batch_of = vec![usize::MAX; args.token_count];
        for (b, &(start, len)) in spans.iter().enumerate() {
            for slot in batch_of.iter_mut().skip(start).take(len) {
                *slot = b;
            }
        }

        let (fused, mask, seq_len) = (args.fused, args.mask, args.seq_len);
        let (num_heads, head_dim, scale) = (args.num_heads, args.head_dim, args.scale);

        args.output
            .par_chunks_mut(hidden)
            .take(args.token_count)
            .enumerate()
            .for_each(|(t, out_row)| {
                let b = batch_of[t];
                if b == usize::MAX {
                    // Token not covered by any span; leave zeros.
                    for o in out_row.iter_mut() {
                        *o = T::zero();
                    }
                    return;
                }
                let (start, len) = spans[b];
                let i = t - start;
                let mask_row = &mask[(b * seq_len + i) * seq_len..][..seq_len];
                let mut scores = vec![0.0f32; len];

                for h in 0..num_heads {
                    let q = &fused[t * stride + fused_offset(h, 0, 0, head_dim)..][..head_dim];

                    let mut max_score = f32::NEG_INFINITY;
                    for (j, s) in scores.iter_mut().enumerate() {
                        let kt = start + j;
                        let key = &fused[kt * stride + fused_offset(h, 1, 0, head_dim)..][..head_dim];
                        if mask_row[j].is_zero() {
                            *s = f32::NEG_INFINITY;
                        } else {
                            let mut dot = 0.0f32;
                            for d in 0..head_dim {
                                dot += q[d].to_f32() * key[d].to_f32();
                            }
                            *s = dot * scale;
                        }
                        max_score = max_score.max(*s);
                    }

                    let mut denom = 0.0f32;
                    if max_score > f32::NEG_INFINITY {
                        for s in scores.iter_mut() {
                            *s = (*s - max_score).exp();
                            denom += *s;
                        }
                    }

                    let out_head = &mut out_row[h * head_dim..(h + 1) * head_dim];
                    if denom == 0.0 {
                        // Fully masked row attends to nothing.
                        for o in out_head.iter_mut() {
                            *o = T::zero();
                        }
                        continue;
                    }
                    for (d, o) in out_head.iter_mut().enumerate() {
                        let mut acc = 0.0f32;
                        for (j, &p) in scores.iter().enumerate() {
                            if p > 0.0 {
                                let vt = start + j;
                                let value =
                                    fused[vt * stride + fused_offset(h, 2, d, head_dim)];
                                acc += p * value.to_f32();
                            }
                        }
                        *o = T::from_f32(acc / denom);
                    }
                }
            });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Dispatch state across one forward call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Constructed, no call seen yet
    Unconfigured,
    /// Capability-checked for a (tile, batch) pair
    Configured {
        /// Pinned tile class
        tile: TileClass,
        /// Pinned batch size
        batch: usize,
    },
    /// Kernel enqueue in flight (transient)
    Running,
}

/// Owns the kernel selected at construction and validates eligibility
/// before every run
#[derive(Debug)]
pub struct FmhaDispatcher<T: Element> {
    kernel: Box<dyn FmhaKernel<T>>,
    state: DispatchState,
}

impl<T: Element> FmhaDispatcher<T> {
    /// Select a kernel for the deployed (generation, head dimension)
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::UnsupportedArch`] when no kernel variant
    /// matches. This is permanent; the layer must not be constructed.
    pub fn for_arch(arch: SmArch, head_dim: usize) -> Result<Self> {
        let spec = select_kernel_spec(arch, head_dim).ok_or_else(|| {
            AtenderError::UnsupportedArch {
                arch: arch.to_string(),
                head_dim,
            }
        })?;
        Ok(Self {
            kernel: Box::new(HostFmhaKernel::from_spec(spec)),
            state: DispatchState::Unconfigured,
        })
    }

    /// Build a dispatcher around an externally supplied kernel
    #[must_use]
    pub fn with_kernel(kernel: Box<dyn FmhaKernel<T>>) -> Self {
        Self {
            kernel,
            state: DispatchState::Unconfigured,
        }
    }

    /// Name of the selected kernel variant
    #[must_use]
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Current dispatch state
    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Workspace elements the selected kernel requires
    #[must_use]
    pub fn workspace_len(&self) -> usize {
        self.kernel.workspace_len()
    }

    /// Map `seq_len` to its tile class and configure the kernel
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::UnsupportedTileClass`] when no class
    /// covers `seq_len` or the kernel lacks the covering class. Both are
    /// static properties, so this surfaces misconfiguration rather than
    /// bad request data.
    pub fn configure(&mut self, seq_len: usize, batch: usize) -> Result<TileClass> {
        let tile = TileClass::covering(seq_len).ok_or_else(|| {
            AtenderError::UnsupportedTileClass {
                kernel: self.kernel.name().to_string(),
                seq_len,
            }
        })?;
        if !self.kernel.supports_tile(tile) {
            return Err(AtenderError::UnsupportedTileClass {
                kernel: self.kernel.name().to_string(),
                seq_len,
            });
        }
        self.kernel.configure(tile, batch)?;
        self.state = DispatchState::Configured { tile, batch };
        Ok(tile)
    }

    /// Enqueue the configured kernel
    ///
    /// # Errors
    ///
    /// Returns `Err` when called before [`Self::configure`] or when the
    /// kernel reports a buffer-contract or device failure.
    pub fn run(&mut self, args: &mut FmhaRunArgs<'_, T>) -> Result<()> {
        if !matches!(self.state, DispatchState::Configured { .. }) {
            return Err(AtenderError::Backend {
                op: "fmha_dispatch",
                reason: format!("run in state {:?}, expected Configured", self.state),
            });
        }
        let configured = self.state;
        self.state = DispatchState::Running;
        let result = self.kernel.run(args);
        self.state = configured;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repack::fused_bias_repack;

    #[test]
    fn test_sm_arch_mapping() {
        assert_eq!(SmArch::from_sm(75), Some(SmArch::Turing));
        assert_eq!(SmArch::from_sm(80), Some(SmArch::Ampere));
        assert_eq!(SmArch::from_sm(86), Some(SmArch::Ampere));
        assert_eq!(SmArch::from_sm(89), Some(SmArch::Ada));
        assert_eq!(SmArch::from_sm(90), Some(SmArch::Hopper));
        assert_eq!(SmArch::from_sm(70), None);
        assert_eq!(SmArch::Ada.to_string(), "sm_89");
    }

    #[test]
    fn test_tile_covering() {
        assert_eq!(TileClass::covering(1), Some(TileClass::S32));
        assert_eq!(TileClass::covering(32), Some(TileClass::S32));
        assert_eq!(TileClass::covering(33), Some(TileClass::S64));
        assert_eq!(TileClass::covering(100), Some(TileClass::S128));
        assert_eq!(TileClass::covering(384), Some(TileClass::S384));
        assert_eq!(TileClass::covering(385), None);
    }

    #[test]
    fn test_kernel_selection_per_arch() {
        let d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, 64).unwrap();
        assert_eq!(d.kernel_name(), "fmha_ampere");
        let d = FmhaDispatcher::<f32>::for_arch(SmArch::Turing, 64).unwrap();
        assert_eq!(d.kernel_name(), "fmha_turing");
        let d = FmhaDispatcher::<f32>::for_arch(SmArch::Hopper, 128).unwrap();
        assert_eq!(d.kernel_name(), "fmha_hopper");
    }

    #[test]
    fn test_unsupported_combination_fails_construction() {
        let err = FmhaDispatcher::<f32>::for_arch(SmArch::Turing, 128).unwrap_err();
        assert!(matches!(err, AtenderError::UnsupportedArch { .. }));
        let err = FmhaDispatcher::<f32>::for_arch(SmArch::Hopper, 256).unwrap_err();
        assert!(matches!(err, AtenderError::UnsupportedArch { .. }));
    }

    #[test]
    fn test_turing_lacks_384_tile() {
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Turing, 64).unwrap();
        assert!(d.configure(256, 1).is_ok());
        let err = d.configure(300, 1).unwrap_err();
        assert!(matches!(err, AtenderError::UnsupportedTileClass { .. }));
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, 4).unwrap();
        assert_eq!(d.state(), DispatchState::Unconfigured);

        let tile = d.configure(8, 1).unwrap();
        assert_eq!(tile, TileClass::S32);
        assert_eq!(
            d.state(),
            DispatchState::Configured {
                tile: TileClass::S32,
                batch: 1
            }
        );
    }

    #[test]
    fn test_run_before_configure_rejected() {
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, 4).unwrap();
        let mut ws = vec![0.0f32; 16];
        let mut out = vec![0.0f32; 8];
        let fused = vec![0.0f32; 24];
        let mask = vec![1.0f32; 4];
        let mut args = FmhaRunArgs {
            fused: &fused,
            mask: &mask,
            padding_offsets: None,
            workspace: &mut ws,
            output: &mut out,
            batch: 1,
            seq_len: 2,
            token_count: 2,
            num_heads: 1,
            head_dim: 4,
            scale: 0.5,
        };
        assert!(d.run(&mut args).is_err());
    }

    /// Two tokens, one head: attention with uniform weights averages the
    /// value rows, which is easy to verify by hand.
    #[test]
    fn test_host_kernel_uniform_attention() {
        let (heads, head_dim) = (1, 2);
        let tokens = 2;
        // Identical queries and keys give uniform attention weights.
        let q = vec![0.0f32; tokens * 2];
        let k = vec![0.0f32; tokens * 2];
        let v = vec![1.0f32, 2.0, 3.0, 4.0];
        let zero_bias = vec![0.0f32; 2];
        let stride = fused_token_stride(heads, head_dim);
        let mut fused = vec![0.0f32; tokens * stride];
        fused_bias_repack(
            &q, &k, &v, &zero_bias, &zero_bias, &zero_bias, &mut fused, tokens, heads, head_dim,
        )
        .unwrap();

        let mask = vec![1.0f32; 4];
        let mut ws = vec![0.0f32; 16];
        let mut out = vec![0.0f32; tokens * 2];
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, head_dim).unwrap();
        d.configure(2, 1).unwrap();
        d.run(&mut FmhaRunArgs {
            fused: &fused,
            mask: &mask,
            padding_offsets: None,
            workspace: &mut ws,
            output: &mut out,
            batch: 1,
            seq_len: 2,
            token_count: 2,
            num_heads: heads,
            head_dim,
            scale: 1.0,
        })
        .unwrap();

        // Every token averages the two value rows: (1+3)/2, (2+4)/2.
        for t in 0..tokens {
            assert!((out[t * 2] - 2.0).abs() < 1e-6);
            assert!((out[t * 2 + 1] - 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mask_excludes_positions() {
        let (heads, head_dim) = (1, 1);
        let tokens = 2;
        let q = vec![0.0f32; 2];
        let k = vec![0.0f32; 2];
        let v = vec![5.0f32, 9.0];
        let zb = vec![0.0f32; 1];
        let stride = fused_token_stride(heads, head_dim);
        let mut fused = vec![0.0f32; tokens * stride];
        fused_bias_repack(&q, &k, &v, &zb, &zb, &zb, &mut fused, tokens, heads, head_dim).unwrap();

        // Row 0 sees only token 0; row 1 sees only token 1.
        let mask = vec![1.0f32, 0.0, 0.0, 1.0];
        let mut ws = vec![0.0f32; 8];
        let mut out = vec![0.0f32; 2];
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, head_dim).unwrap();
        d.configure(2, 1).unwrap();
        d.run(&mut FmhaRunArgs {
            fused: &fused,
            mask: &mask,
            padding_offsets: None,
            workspace: &mut ws,
            output: &mut out,
            batch: 1,
            seq_len: 2,
            token_count: 2,
            num_heads: heads,
            head_dim,
            scale: 1.0,
        })
        .unwrap();
        assert!((out[0] - 5.0).abs() < 1e-6);
        assert!((out[1] - 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_fully_masked_row_outputs_zero() {
        let (heads, head_dim) = (1, 1);
        let fused = vec![1.0f32; 2 * 3];
        let mask = vec![0.0f32; 4];
        let mut ws = vec![0.0f32; 8];
        let mut out = vec![7.0f32; 2];
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, head_dim).unwrap();
        d.configure(2, 1).unwrap();
        d.run(&mut FmhaRunArgs {
            fused: &fused,
            mask: &mask,
            padding_offsets: None,
            workspace: &mut ws,
            output: &mut out,
            batch: 1,
            seq_len: 2,
            token_count: 2,
            num_heads: heads,
            head_dim,
            scale: 1.0,
        })
        .unwrap();
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_padding_offsets_compact_batch() {
        // Two sequences of lengths 1 and 2, packed into 3 tokens with a
        // padded seq_len of 2. Values differ per token so leakage across
        // sequences would show.
        let (heads, head_dim) = (1, 1);
        let token_count = 3;
        let q = vec![0.0f32; 3];
        let k = vec![0.0f32; 3];
        let v = vec![10.0f32, 20.0, 40.0];
        let zb = vec![0.0f32; 1];
        let stride = fused_token_stride(heads, head_dim);
        let mut fused = vec![0.0f32; token_count * stride];
        fused_bias_repack(&q, &k, &v, &zb, &zb, &zb, &mut fused, token_count, heads, head_dim)
            .unwrap();

        let offsets: Vec<i32> = vec![0, 1, 3];
        let mask = vec![1.0f32; 2 * 2 * 2];
        let mut ws = vec![0.0f32; 8];
        let mut out = vec![0.0f32; 3];
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, head_dim).unwrap();
        d.configure(2, 2).unwrap();
        d.run(&mut FmhaRunArgs {
            fused: &fused,
            mask: &mask,
            padding_offsets: Some(&offsets),
            workspace: &mut ws,
            output: &mut out,
            batch: 2,
            seq_len: 2,
            token_count,
            num_heads: heads,
            head_dim,
            scale: 1.0,
        })
        .unwrap();

        // Sequence 0 is the single token 0. Sequence 1 averages tokens
        // 1 and 2 under uniform attention.
        assert!((out[0] - 10.0).abs() < 1e-6);
        assert!((out[1] - 30.0).abs() < 1e-6);
        assert!((out[2] - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_padding_offsets_bad_total_rejected() {
        let spans = sequence_spans(2, 2, 4, Some(&[0, 1, 3]));
        assert!(spans.is_err());
    }

    #[test]
    fn test_padding_offsets_two_b_plus_one_accepted() {
        let spans = sequence_spans(2, 2, 3, Some(&[0, 1, 3, 0, 0])).unwrap();
        assert_eq!(spans, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_workspace_capacity_enforced() {
        let mut d = FmhaDispatcher::<f32>::for_arch(SmArch::Ampere, 1).unwrap();
        d.configure(2, 1).unwrap();
        let fused = vec![0.0f32; 6];
        let mask = vec![1.0f32; 4];
        let mut ws = vec![0.0f32; 1]; // needs seq*seq = 4
        let mut out = vec![0.0f32; 2];
        let err = d
            .run(&mut FmhaRunArgs {
                fused: &fused,
                mask: &mask,
                padding_offsets: None,
                workspace: &mut ws,
                output: &mut out,
                batch: 1,
                seq_len: 2,
                token_count: 2,
                num_heads: 1,
                head_dim: 1,
                scale: 1.0,
            })
            .unwrap_err();
        assert!(matches!(err, AtenderError::Backend { .. }));
    }
}
