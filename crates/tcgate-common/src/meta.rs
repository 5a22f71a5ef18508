//! Per-packet side-channel metadata
//!
//! The pipeline sees the frame bytes plus a small amount of metadata that the
//! attaching layer carries alongside them: the ingress interface and a 32-bit
//! mark that downstream consumers read.

use serde::{Deserialize, Serialize};

/// Default mark value tagging workload-sourced traffic
pub const DEFAULT_WORKLOAD_MARK: u32 = 0xca10_0000;

/// Default mask covering the workload mark bits
pub const DEFAULT_WORKLOAD_MASK: u32 = 0xffff_0000;

/// Metadata travelling with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SkbMeta {
    /// Interface the frame was received on
    pub ingress_ifindex: u32,
    /// Packet mark
    pub mark: u32,
}

impl SkbMeta {
    /// Create metadata for a frame received on `ifindex`
    #[inline(always)]
    pub const fn new(ingress_ifindex: u32) -> Self {
        Self {
            ingress_ifindex,
            mark: 0,
        }
    }
}

/// Origin mark: a value written under a mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadMark {
    /// Bits identifying workload-sourced traffic
    pub value: u32,
    /// Bits of the mark owned by the origin tag
    pub mask: u32,
}

impl WorkloadMark {
    /// Create a mark
    pub const fn new(value: u32, mask: u32) -> Self {
        Self { value, mask }
    }

    /// The value only uses bits inside the mask
    pub const fn is_valid(&self) -> bool {
        self.value & !self.mask == 0
    }

    /// Whether `mark` already carries the origin tag
    #[inline(always)]
    pub const fn is_set(&self, mark: u32) -> bool {
        mark & self.mask == self.value
    }

    /// Write the tag into `mark`, leaving bits outside the mask untouched
    #[inline(always)]
    pub const fn apply(&self, mark: u32) -> u32 {
        (mark & !self.mask) | self.value
    }
}

impl Default for WorkloadMark {
    fn default() -> Self {
        Self::new(DEFAULT_WORKLOAD_MARK, DEFAULT_WORKLOAD_MASK)
    }
}
