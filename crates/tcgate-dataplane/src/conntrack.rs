//! Connection Tracking
//!
//! Concurrent connection table shared by every pipeline invocation.
//!
//! # Design
//!
//! - Sharded concurrent map (dashmap) with insert-if-absent semantics
//! - Keys are direction-normalised: one entry answers for both directions
//! - NAT flows own two entries: the pre-NAT key carries the DNAT leg, the
//!   post-NAT key carries the SNAT leg for return traffic. Each leg names its
//!   peer; the pair is aged and removed as one flow
//! - Aging is owned by an external sweeper; the pipeline never expires entries

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use tcgate_common::{AttachPoint, FlowTuple, IpProto, Timestamp};

use crate::packet::{L4Header, TcpFlags, ICMP_ECHOREPLY};

/// Result of a connection lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtLookup {
    /// No entry and the packet may not open one
    NotFound,
    /// No entry; the packet may open a flow
    New,
    /// Known flow, no translation
    Established,
    /// Known flow, destination must be rewritten to this endpoint
    EstablishedDnat(SocketAddrV4),
    /// Known flow, source must be rewritten to this endpoint
    EstablishedSnat(SocketAddrV4),
}

/// Connection table contract consumed by the pipeline
pub trait ConntrackTable: Send + Sync {
    /// Look up the flow a packet belongs to. Hits refresh the entry.
    fn lookup(&self, tuple: &FlowTuple, l4: &L4Header) -> CtLookup;

    /// Same answer as [`lookup`](Self::lookup), leaving the entry untouched
    fn peek(&self, tuple: &FlowTuple, l4: &L4Header) -> CtLookup;

    /// Record a plain flow opened by `tuple`
    fn create(&self, tuple: &FlowTuple, l4: &L4Header, attach: AttachPoint) -> Result<(), ConntrackError>;

    /// Record a flow whose destination is translated to `xlate`. Forward
    /// traffic then resolves to `EstablishedDnat`, return traffic from
    /// `xlate` to `EstablishedSnat`.
    fn create_with_nat(
        &self,
        tuple: &FlowTuple,
        l4: &L4Header,
        xlate: SocketAddrV4,
        attach: AttachPoint,
    ) -> Result<(), ConntrackError>;
}

/// Connection table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConntrackError {
    /// No room for the entries the flow needs
    #[error("connection table is full")]
    TableFull,

    /// Another packet created the entry first
    #[error("connection entry already exists")]
    InsertRace,
}

/// Direction-normalised key: `lo` sorts before `hi`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CtKey {
    /// IP protocol number
    pub protocol: u8,
    /// Lower endpoint
    pub lo: SocketAddrV4,
    /// Higher endpoint
    pub hi: SocketAddrV4,
}

impl CtKey {
    /// Key for the flow `tuple` belongs to, in either direction
    #[inline(always)]
    pub fn new(tuple: &FlowTuple) -> Self {
        let (a, b) = (tuple.src(), tuple.dst());
        let rank = |s: &SocketAddrV4| (u32::from(*s.ip()), s.port());
        if rank(&a) <= rank(&b) {
            Self { protocol: tuple.protocol, lo: a, hi: b }
        } else {
            Self { protocol: tuple.protocol, lo: b, hi: a }
        }
    }
}

/// What an entry does to the packets that hit it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CtKind {
    /// No translation
    Normal,
    /// Pre-NAT leg: traffic from the opener goes to `xlate`
    NatForward {
        /// Translated destination
        xlate: SocketAddrV4,
        /// Post-NAT leg; `None` for an identity translation
        peer: Option<CtKey>,
    },
    /// Post-NAT leg: traffic towards the opener appears to come from `orig_dst`
    NatReverse {
        /// Destination the opener addressed
        orig_dst: SocketAddrV4,
        /// Pre-NAT leg
        peer: CtKey,
    },
}

impl CtKind {
    /// Key of the other leg of a NAT flow
    #[inline(always)]
    pub fn peer(&self) -> Option<CtKey> {
        match *self {
            Self::Normal => None,
            Self::NatForward { peer, .. } => peer,
            Self::NatReverse { peer, .. } => Some(peer),
        }
    }
}

/// Coarse TCP state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TcpState {
    /// Not TCP
    None = 0,
    /// Opening SYN seen
    SynSent = 1,
    /// Reply seen
    Established = 2,
    /// One side sent FIN
    FinWait = 3,
    /// Both sides finished, or reset
    Closed = 4,
}

impl TcpState {
    fn advance(self, flags: TcpFlags) -> Self {
        if flags.contains(TcpFlags::RST) {
            return Self::Closed;
        }
        if flags.contains(TcpFlags::FIN) {
            return match self {
                Self::FinWait | Self::Closed => Self::Closed,
                _ => Self::FinWait,
            };
        }
        match self {
            Self::SynSent if flags.contains(TcpFlags::ACK) => Self::Established,
            other => other,
        }
    }
}

/// Connection table entry
#[derive(Debug, Clone, Serialize)]
pub struct CtEntry {
    /// Translation applied by this entry
    pub kind: CtKind,
    /// Endpoint that sent the first packet
    pub opener: SocketAddrV4,
    /// Hook the flow was opened on
    pub attach: AttachPoint,
    /// TCP state (None for other protocols)
    pub tcp_state: TcpState,
    /// Packets seen after creation
    pub packets: u64,
    /// Creation time (ns)
    pub first_seen: u64,
    /// Last hit (ns)
    pub last_seen: u64,
}

impl CtEntry {
    fn new(kind: CtKind, tuple: &FlowTuple, l4: &L4Header, attach: AttachPoint) -> Self {
        let now = Timestamp::now().as_nanos();
        let tcp_state = match l4 {
            L4Header::Tcp { .. } => TcpState::SynSent,
            _ => TcpState::None,
        };
        Self {
            kind,
            opener: tuple.src(),
            attach,
            tcp_state,
            packets: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    #[inline(always)]
    fn touch(&mut self, l4: &L4Header) {
        self.packets += 1;
        self.last_seen = Timestamp::now().as_nanos();
        if let Some(flags) = l4.tcp_flags() {
            self.tcp_state = self.tcp_state.advance(flags);
        }
    }

    /// How a packet with source `src` is handled by this entry
    #[inline(always)]
    fn resolve(&self, src: SocketAddrV4) -> CtLookup {
        let from_opener = src == self.opener;
        match self.kind {
            CtKind::Normal => CtLookup::Established,
            CtKind::NatForward { xlate, .. } if from_opener => CtLookup::EstablishedDnat(xlate),
            CtKind::NatForward { .. } => CtLookup::Established,
            CtKind::NatReverse { .. } if from_opener => CtLookup::Established,
            CtKind::NatReverse { orig_dst, .. } => CtLookup::EstablishedSnat(orig_dst),
        }
    }
}

/// Whether a packet without an entry may open a flow
#[inline(always)]
fn may_open(tuple: &FlowTuple, l4: &L4Header) -> bool {
    match (tuple.proto(), l4) {
        (Some(IpProto::Tcp), L4Header::Tcp { flags }) => flags.is_syn_only(),
        (Some(IpProto::Udp), _) => true,
        (Some(IpProto::Icmp), L4Header::Icmp { icmp_type, .. }) => *icmp_type != ICMP_ECHOREPLY,
        _ => false,
    }
}

/// Reference [`ConntrackTable`] backed by a sharded map
pub struct ConntrackMap {
    entries: DashMap<CtKey, CtEntry>,
    capacity: usize,
    count: AtomicUsize,
}

impl ConntrackMap {
    /// Create an empty table holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity.min(1 << 16)),
            capacity,
            count: AtomicUsize::new(0),
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for a flow, in either direction
    pub fn get(&self, tuple: &FlowTuple) -> Option<CtEntry> {
        self.entries.get(&CtKey::new(tuple)).map(|e| e.value().clone())
    }

    /// Remove the flow a tuple maps to, both legs for NAT flows. Returns the
    /// entry stored under the tuple's own key.
    pub fn remove(&self, tuple: &FlowTuple) -> Option<CtEntry> {
        self.remove_flow(&CtKey::new(tuple)).map(|(entry, _)| entry)
    }

    /// Drop every flow whose newest leg was last seen before `cutoff_ns`;
    /// returns how many entries went
    pub fn expire_older_than(&self, cutoff_ns: u64) -> usize {
        let stale: Vec<CtKey> = self
            .entries
            .iter()
            .filter(|e| e.last_seen < cutoff_ns)
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for key in stale {
            // gone already when its peer was swept earlier in this pass
            let Some((last_seen, peer)) = self
                .entries
                .get(&key)
                .map(|e| (e.last_seen, e.kind.peer()))
            else {
                continue;
            };
            let peer_seen = peer
                .and_then(|p| self.entries.get(&p).map(|e| e.last_seen))
                .unwrap_or(0);
            if last_seen.max(peer_seen) >= cutoff_ns {
                continue;
            }
            if let Some((_, n)) = self.remove_flow(&key) {
                removed += n;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, cutoff_ns, "expired connection entries");
        }
        removed
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<(CtKey, CtEntry)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Remove everything
    pub fn clear(&self) {
        self.entries.clear();
        self.count.store(0, Ordering::Relaxed);
    }

    /// Reserve `n` slots against the capacity
    fn reserve(&self, n: usize) -> Result<(), ConntrackError> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |count| {
                (count + n <= self.capacity).then_some(count + n)
            })
            .map(|_| ())
            .map_err(|_| ConntrackError::TableFull)
    }

    fn release(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::Relaxed);
    }

    /// Remove the entry at `key` and its peer leg. Only successful removals
    /// are released from the count.
    fn remove_flow(&self, key: &CtKey) -> Option<(CtEntry, usize)> {
        let (_, entry) = self.entries.remove(key)?;
        let mut removed = 1;
        if let Some(peer) = entry.kind.peer() {
            if self
                .entries
                .remove_if(&peer, |_, e| e.kind.peer() == Some(*key))
                .is_some()
            {
                removed += 1;
            }
        }
        self.release(removed);
        Some((entry, removed))
    }

    /// Insert if absent. The slot must already be reserved.
    fn insert_reserved(&self, key: CtKey, entry: CtEntry) -> Result<(), ConntrackError> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(ConntrackError::InsertRace),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }
}

impl ConntrackTable for ConntrackMap {
    #[inline]
    fn lookup(&self, tuple: &FlowTuple, l4: &L4Header) -> CtLookup {
        if let Some(mut entry) = self.entries.get_mut(&CtKey::new(tuple)) {
            entry.touch(l4);
            return entry.resolve(tuple.src());
        }

        if may_open(tuple, l4) {
            CtLookup::New
        } else {
            CtLookup::NotFound
        }
    }

    fn peek(&self, tuple: &FlowTuple, l4: &L4Header) -> CtLookup {
        match self.entries.get(&CtKey::new(tuple)) {
            Some(entry) => entry.resolve(tuple.src()),
            None if may_open(tuple, l4) => CtLookup::New,
            None => CtLookup::NotFound,
        }
    }

    fn create(&self, tuple: &FlowTuple, l4: &L4Header, attach: AttachPoint) -> Result<(), ConntrackError> {
        self.reserve(1)?;
        let entry = CtEntry::new(CtKind::Normal, tuple, l4, attach);
        self.insert_reserved(CtKey::new(tuple), entry).map_err(|e| {
            self.release(1);
            e
        })
    }

    fn create_with_nat(
        &self,
        tuple: &FlowTuple,
        l4: &L4Header,
        xlate: SocketAddrV4,
        attach: AttachPoint,
    ) -> Result<(), ConntrackError> {
        let fwd_key = CtKey::new(tuple);
        let post_nat = tuple.with_dst(xlate);
        let rev_key = CtKey::new(&post_nat);

        // identity translation: one entry answers both directions
        if rev_key == fwd_key {
            self.reserve(1)?;
            let entry = CtEntry::new(CtKind::NatForward { xlate, peer: None }, tuple, l4, attach);
            return self.insert_reserved(fwd_key, entry).map_err(|e| {
                self.release(1);
                e
            });
        }

        self.reserve(2)?;

        let fwd = CtEntry::new(
            CtKind::NatForward {
                xlate,
                peer: Some(rev_key),
            },
            tuple,
            l4,
            attach,
        );
        if let Err(e) = self.insert_reserved(fwd_key, fwd) {
            self.release(2);
            return Err(e);
        }

        let rev = CtEntry::new(
            CtKind::NatReverse {
                orig_dst: tuple.dst(),
                peer: fwd_key,
            },
            &post_nat,
            l4,
            attach,
        );
        if let Err(e) = self.insert_reserved(rev_key, rev) {
            self.entries.remove(&fwd_key);
            self.release(2);
            tracing::debug!(flow = %tuple, "reverse NAT leg already present, rolled back");
            return Err(e);
        }

        Ok(())
    }
}
