//! Pre-allocated scratch workspace for the attention forward pass
//!
//! All intermediate buffers of one forward call live here and are reused
//! across calls: three per-projection buffers, the fused interleaved
//! buffer, the post-attention context buffer, the attention kernel's own
//! workspace, and the small pointer table staged by the batched
//! projection path. Regions are sized from the layer's configured maxima,
//! not from the live call's shape, so one allocation serves every
//! admissible call.
//!
//! Lifecycle invariant: either all regions are valid or none are. One
//! `allocated` flag governs the whole set; no partial state is
//! observable.

use crate::backend::{DeviceAllocator, DeviceBuffer};
use crate::error::Result;
use crate::matmul::PointerTable;
use crate::tensor::Element;

/// Element accounting for an allocated workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceStats {
    /// Elements in each of the three projection buffers
    pub projection_elems: usize,
    /// Elements in the fused interleaved buffer
    pub fused_elems: usize,
    /// Elements in the post-attention context buffer
    pub context_elems: usize,
    /// Elements in the attention kernel workspace
    pub kernel_elems: usize,
    /// Total elements across all six regions
    pub total_elems: usize,
}

/// Scratch buffer set owned by one attention layer instance
#[derive(Debug)]
pub struct AttentionWorkspace<T: Element> {
    /// Raw query projection output, `[max_tokens, hidden]`
    pub q_buf: Option<DeviceBuffer<T>>,
    /// Raw key projection output, `[max_tokens, hidden]`
    pub k_buf: Option<DeviceBuffer<T>>,
    /// Raw value projection output, `[max_tokens, hidden]`
    pub v_buf: Option<DeviceBuffer<T>>,
    /// Bias-fused interleaved Q/K/V, `[max_tokens, heads, 3, head_dim]`
    pub fused_buf: Option<DeviceBuffer<T>>,
    /// Post-attention context, `[max_tokens, hidden]`
    pub context_buf: Option<DeviceBuffer<T>>,
    /// Attention kernel workspace, kernel-reported size
    pub kernel_buf: Option<DeviceBuffer<T>>,
    /// Staging table for the batched projection path
    pub pointer_table: Option<Box<PointerTable>>,
    allocated: bool,
    unit_len: usize,
}

impl<T: Element> Default for AttentionWorkspace<T> {
    fn default() -> Self {
        Self {
            q_buf: None,
            k_buf: None,
            v_buf: None,
            fused_buf: None,
            context_buf: None,
            kernel_buf: None,
            pointer_table: None,
            allocated: false,
            unit_len: 0,
        }
    }
}

impl<T: Element> AttentionWorkspace<T> {
    /// Create an empty, unallocated workspace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the region set is currently allocated
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Elements per unit region (`max_batch * max_seq * hidden`)
    #[must_use]
    pub fn unit_len(&self) -> usize {
        self.unit_len
    }

    /// Ensure all regions exist; idempotent
    ///
    /// On first use requests every region from `alloc` sized for
    /// `max_batch * max_seq` tokens of `hidden` channels, plus the
    /// kernel-reported `kernel_ws_len`. If any allocation fails, the
    /// regions already obtained are returned to the allocator and the
    /// workspace stays unallocated.
    ///
    /// # Errors
    ///
    /// Propagates allocator failure.
    pub fn ensure_allocated<A: DeviceAllocator<T>>(
        &mut self,
        alloc: &mut A,
        max_batch: usize,
        max_seq: usize,
        hidden: usize,
        kernel_ws_len: usize,
    ) -> Result<()> {
        if self.allocated {
            return Ok(());
        }

        let unit = max_batch * max_seq * hidden;
        let sizes = [unit, unit, unit, 3 * unit, unit, kernel_ws_len];
        let mut regions: Vec<DeviceBuffer<T>> = Vec::with_capacity(sizes.len());
        for len in sizes {
            match alloc.allocate(len) {
                Ok(buf) => regions.push(buf),
                Err(e) => {
                    for buf in regions {
                        alloc.release(buf);
                    }
                    return Err(e);
                }
            }
        }

        // Assign in reverse pop order; all-or-none holds because every
        // allocation above succeeded.
        self.kernel_buf = regions.pop();
        self.context_buf = regions.pop();
        self.fused_buf = regions.pop();
        self.v_buf = regions.pop();
        self.k_buf = regions.pop();
        self.q_buf = regions.pop();
        self.pointer_table = Some(Box::new(PointerTable::default()));
        self.unit_len = unit;
        self.allocated = true;
        Ok(())
    }

    /// Release all regions; idempotent, a no-op when unallocated
    pub fn release<A: DeviceAllocator<T>>(&mut self, alloc: &mut A) {
        if !self.allocated {
            return;
        }
        for buf in [
            self.q_buf.take(),
            self.k_buf.take(),
            self.v_buf.take(),
            self.fused_buf.take(),
            self.context_buf.take(),
            self.kernel_buf.take(),
        ]
        .into_iter()
        .flatten()
        {
            alloc.release(buf);
        }
        self.pointer_table = None;
        self.unit_len = 0;
        self.allocated = false;
    }

    /// Accounting snapshot; zeros when unallocated
    #[must_use]
    pub fn stats(&self) -> WorkspaceStats {
        if !self.allocated {
            return WorkspaceStats::default();
        }
        let len = |b: &Option<DeviceBuffer<T>>| b.as_ref().map_or(0, DeviceBuffer::len);
        let projection_elems = len(&self.q_buf);
        let fused_elems = len(&self.fused_buf);
        let context_elems = len(&self.context_buf);
        let kernel_elems = len(&self.kernel_buf);
        WorkspaceStats {
            projection_elems,
            fused_elems,
            context_elems,
            kernel_elems,
            total_elems: 3 * projection_elems + fused_elems + context_elems + kernel_elems,
        }
    }
}
