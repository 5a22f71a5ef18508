//! Dataplane Statistics
//!
//! Lock-free counters shared by every pipeline invocation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tcgate_common::metrics::{HistogramSnapshot, LatencyHistogram};

use crate::decision::{Decision, FibStatus, Reason, TcAction};

/// Pipeline counters (cache-line aligned)
#[repr(C, align(64))]
pub struct DataplaneStats {
    /// Frames handed to the pipeline
    pub rx_packets: AtomicU64,
    /// Bytes handed to the pipeline
    pub rx_bytes: AtomicU64,
    /// `TC_ACT_UNSPEC` decisions
    pub passed: AtomicU64,
    /// `TC_ACT_SHOT` decisions
    pub dropped: AtomicU64,
    /// Redirect decisions
    pub redirected: AtomicU64,
    /// Packets matching a connection entry
    pub ct_hits: AtomicU64,
    /// Packets with no connection entry
    pub ct_misses: AtomicU64,
    /// Connection entries created
    pub ct_creates: AtomicU64,
    /// Inserts lost to a concurrent packet
    pub ct_races: AtomicU64,
    /// New flows translated by a frontend
    pub nat_hits: AtomicU64,
    /// FIB lookups rejected as bad input
    pub fib_bad_input: AtomicU64,
    /// FIB lookups without a route
    pub fib_no_route: AtomicU64,
    /// Packets tagged with the origin mark
    pub marked: AtomicU64,
    reasons: [AtomicU64; Reason::COUNT],
    latency: LatencyHistogram,
}

impl Default for DataplaneStats {
    fn default() -> Self {
        Self {
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            redirected: AtomicU64::new(0),
            ct_hits: AtomicU64::new(0),
            ct_misses: AtomicU64::new(0),
            ct_creates: AtomicU64::new(0),
            ct_races: AtomicU64::new(0),
            nat_hits: AtomicU64::new(0),
            fib_bad_input: AtomicU64::new(0),
            fib_no_route: AtomicU64::new(0),
            marked: AtomicU64::new(0),
            reasons: std::array::from_fn(|_| AtomicU64::new(0)),
            latency: LatencyHistogram::new(),
        }
    }
}

#[inline(always)]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DataplaneStats {
    /// Count a received frame
    #[inline(always)]
    pub fn record_rx(&self, bytes: usize) {
        bump(&self.rx_packets);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Connection entry found
    #[inline(always)]
    pub fn record_ct_hit(&self) {
        bump(&self.ct_hits);
    }

    /// No connection entry
    #[inline(always)]
    pub fn record_ct_miss(&self) {
        bump(&self.ct_misses);
    }

    /// Connection entry created
    #[inline(always)]
    pub fn record_ct_create(&self) {
        bump(&self.ct_creates);
    }

    /// Insert lost to another packet
    #[inline(always)]
    pub fn record_ct_race(&self) {
        bump(&self.ct_races);
    }

    /// New flow translated
    #[inline(always)]
    pub fn record_nat_hit(&self) {
        bump(&self.nat_hits);
    }

    /// Origin mark applied
    #[inline(always)]
    pub fn record_mark(&self) {
        bump(&self.marked);
    }

    /// Account for a finished invocation
    #[inline(always)]
    pub fn record_decision(&self, decision: &Decision, latency_ns: u64) {
        match decision.action {
            TcAction::Unspec => bump(&self.passed),
            TcAction::Shot => bump(&self.dropped),
            TcAction::Redirect(_) => bump(&self.redirected),
        }
        match decision.fib {
            FibStatus::BadInput => bump(&self.fib_bad_input),
            FibStatus::NoRoute => bump(&self.fib_no_route),
            FibStatus::Skipped | FibStatus::Redirected => {}
        }
        bump(&self.reasons[decision.reason.index()]);
        self.latency.record(latency_ns);
    }

    /// Count for one reason
    pub fn reason_count(&self, reason: Reason) -> u64 {
        self.reasons[reason.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> DataplaneStatsSnapshot {
        let reasons = Reason::ALL
            .iter()
            .filter_map(|r| {
                let n = self.reason_count(*r);
                (n > 0).then(|| (r.as_str(), n))
            })
            .collect();

        DataplaneStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            redirected: self.redirected.load(Ordering::Relaxed),
            ct_hits: self.ct_hits.load(Ordering::Relaxed),
            ct_misses: self.ct_misses.load(Ordering::Relaxed),
            ct_creates: self.ct_creates.load(Ordering::Relaxed),
            ct_races: self.ct_races.load(Ordering::Relaxed),
            nat_hits: self.nat_hits.load(Ordering::Relaxed),
            fib_bad_input: self.fib_bad_input.load(Ordering::Relaxed),
            fib_no_route: self.fib_no_route.load(Ordering::Relaxed),
            marked: self.marked.load(Ordering::Relaxed),
            reasons,
            latency: self.latency.snapshot(),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataplaneStatsSnapshot {
    /// Frames handed to the pipeline
    pub rx_packets: u64,
    /// Bytes handed to the pipeline
    pub rx_bytes: u64,
    /// `TC_ACT_UNSPEC` decisions
    pub passed: u64,
    /// `TC_ACT_SHOT` decisions
    pub dropped: u64,
    /// Redirect decisions
    pub redirected: u64,
    /// Packets matching a connection entry
    pub ct_hits: u64,
    /// Packets with no connection entry
    pub ct_misses: u64,
    /// Connection entries created
    pub ct_creates: u64,
    /// Inserts lost to a concurrent packet
    pub ct_races: u64,
    /// New flows translated by a frontend
    pub nat_hits: u64,
    /// FIB lookups rejected as bad input
    pub fib_bad_input: u64,
    /// FIB lookups without a route
    pub fib_no_route: u64,
    /// Packets tagged with the origin mark
    pub marked: u64,
    /// Non-zero per-reason counts
    pub reasons: BTreeMap<&'static str, u64>,
    /// Per-packet processing time
    pub latency: HistogramSnapshot,
}

impl DataplaneStatsSnapshot {
    /// Share of tracked packets that hit an existing entry
    pub fn ct_hit_rate(&self) -> f64 {
        let total = self.ct_hits + self.ct_misses;
        if total == 0 {
            return 0.0;
        }
        self.ct_hits as f64 / total as f64
    }

    /// Packets whose FIB lookup failed and fell back to the stack
    pub fn fib_fallbacks(&self) -> u64 {
        self.fib_bad_input + self.fib_no_route
    }
}
