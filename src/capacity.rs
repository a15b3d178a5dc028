//! Capacity and validity guarding
//!
//! A layer instance has a fixed capacity: a maximum batch size and a
//! maximum sequence length. Either bound may start unset (configured as
//! zero); the first observed call pins it. After that the bound is a hard
//! ceiling and violations abort the call before any buffer allocation or
//! device work.
//!
//! Sequence length additionally has an absolute ceiling of 384 tokens,
//! the largest tile class any dispatched kernel supports, independent of
//! configuration.

use serde::{Deserialize, Serialize};

use crate::error::{AtenderError, Result};

/// Largest sequence length any fused attention kernel supports
pub const MAX_SEQ_LEN: usize = 384;

/// Lifecycle of one capacity bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// No bound observed yet; the first call adopts its value
    Unset,
    /// Pinned bound; later calls must stay at or under it
    Bound(usize),
}

impl Capacity {
    /// Build from a configured value, where zero means unset
    #[must_use]
    pub fn from_config(value: usize) -> Self {
        if value == 0 {
            Capacity::Unset
        } else {
            Capacity::Bound(value)
        }
    }

    /// The pinned value, if any
    #[must_use]
    pub fn bound(&self) -> Option<usize> {
        match self {
            Capacity::Unset => None,
            Capacity::Bound(v) => Some(*v),
        }
    }
}

/// Guards one layer instance's batch-size and sequence-length bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityGuard {
    max_batch_size: Capacity,
    max_seq_len: Capacity,
}

impl CapacityGuard {
    /// Create a guard from configured maxima (zero means adopt-on-first-use)
    #[must_use]
    pub fn new(max_batch_size: usize, max_seq_len: usize) -> Self {
        Self {
            max_batch_size: Capacity::from_config(max_batch_size),
            max_seq_len: Capacity::from_config(max_seq_len),
        }
    }

    /// Validate a batch size, adopting it if no bound is pinned yet
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::CapacityExceeded`] when the batch size
    /// exceeds the pinned bound.
    pub fn check_batch_size(&mut self, batch_size: usize) -> Result<()> {
        match self.max_batch_size {
            Capacity::Unset => {
                self.max_batch_size = Capacity::Bound(batch_size);
                Ok(())
            }
            Capacity::Bound(limit) if batch_size <= limit => Ok(()),
            Capacity::Bound(limit) => Err(AtenderError::CapacityExceeded {
                what: "batch_size",
                requested: batch_size,
                limit,
            }),
        }
    }

    /// Validate a sequence length, adopting it if no bound is pinned yet
    ///
    /// The absolute [`MAX_SEQ_LEN`] ceiling applies regardless of the
    /// configured bound.
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::CapacityExceeded`] when the length exceeds
    /// either the pinned bound or the absolute ceiling.
    pub fn check_seq_len(&mut self, seq_len: usize) -> Result<()> {
        if seq_len > MAX_SEQ_LEN {
            return Err(AtenderError::CapacityExceeded {
                what: "seq_len",
                requested: seq_len,
                limit: MAX_SEQ_LEN,
            });
        }
        match self.max_seq_len {
            Capacity::Unset => {
                self.max_seq_len = Capacity::Bound(seq_len);
                Ok(())
            }
            Capacity::Bound(limit) if seq_len <= limit => Ok(()),
            Capacity::Bound(limit) => Err(AtenderError::CapacityExceeded {
                what: "seq_len",
                requested: seq_len,
                limit,
            }),
        }
    }

    /// Pinned batch-size bound, if any
    #[must_use]
    pub fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size.bound()
    }

    /// Pinned sequence-length bound, if any
    #[must_use]
    pub fn max_seq_len(&self) -> Option<usize> {
        self.max_seq_len.bound()
    }
}
