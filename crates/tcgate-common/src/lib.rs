//! tcgate Common - Shared types for the per-packet forwarding decision engine
//!
//! This crate provides the small, copyable primitives every other tcgate crate
//! agrees on:
//! - IPv4 flow tuples and protocol numbers
//! - Attachment points (the four places the pipeline is hooked in)
//! - Side-channel packet metadata and the workload origin mark
//! - Error handling
//! - Lock-free counters, latency histograms and timestamps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attach;
pub mod error;
pub mod flow;
pub mod meta;
pub mod metrics;

pub use attach::AttachPoint;
pub use error::*;
pub use flow::*;
pub use meta::{SkbMeta, WorkloadMark};

use std::sync::atomic::{AtomicU64, Ordering};

/// Wall-clock nanosecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Get current timestamp (nanoseconds since epoch)
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }

    /// Get nanoseconds value
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed since this timestamp
    #[inline(always)]
    pub fn elapsed_nanos(&self) -> u64 {
        Self::now().0.saturating_sub(self.0)
    }
}

/// Lock-free counter shared between dataplane workers
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
