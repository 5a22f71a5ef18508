//! Internet checksum arithmetic
//!
//! Incremental updates follow RFC 1624, eqn. 3: `HC' = ~(~HC + ~m + m')`.
//! Unlike eqn. 2 this never turns a valid checksum into `-0`, so the result
//! is bit-identical to recomputing from scratch.

use std::net::Ipv4Addr;

use crate::packet::{
    read_ipv4, read_u16, ETH_P_IP, ETH_PROTO, IP_CSUM, IP_DADDR, IP_PROTO, IP_SADDR, IP_TOT_LEN,
    L3_OFF, L4_OFF, TCP_CSUM, TCP_HLEN, UDP_CSUM, UDP_HLEN,
};
use tcgate_common::IpProto;

/// One's complement accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u64);

impl Checksum {
    /// Empty sum
    pub const fn new() -> Self {
        Self(0)
    }

    /// Resume from a checksum field value
    #[inline(always)]
    pub const fn from_inverted(check: u16) -> Self {
        Self((!check) as u64)
    }

    /// Add one 16-bit word
    #[inline(always)]
    pub fn add_u16(&mut self, word: u16) {
        self.0 += word as u64;
    }

    /// Add a 32-bit value as two words
    #[inline(always)]
    pub fn add_u32(&mut self, value: u32) {
        self.add_u16((value >> 16) as u16);
        self.add_u16(value as u16);
    }

    /// Add big-endian words; an odd trailing byte is padded with zero
    pub fn add_slice(&mut self, data: &[u8]) {
        let mut iter = data.chunks_exact(2);
        let full: u64 = iter
            .by_ref()
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]) as u64)
            .sum();
        let tail = match iter.remainder() {
            [high] => (*high as u64) << 8,
            _ => 0,
        };
        self.0 += full + tail;
    }

    /// Folded 16-bit sum (not inverted)
    #[inline(always)]
    pub fn fold(&self) -> u16 {
        let mut sum = self.0;
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// Value to store in a checksum field
    #[inline(always)]
    pub fn finish(&self) -> u16 {
        !self.fold()
    }
}

/// Update `check` for a 16-bit field changing from `old` to `new`
#[inline(always)]
pub fn replace_u16(check: u16, old: u16, new: u16) -> u16 {
    let mut sum = Checksum::from_inverted(check);
    sum.add_u16(!old);
    sum.add_u16(new);
    sum.finish()
}

/// Update `check` for a 32-bit field changing from `old` to `new`
#[inline(always)]
pub fn replace_u32(check: u16, old: u32, new: u32) -> u16 {
    let mut sum = Checksum::from_inverted(check);
    sum.add_u16(!((old >> 16) as u16));
    sum.add_u16(!(old as u16));
    sum.add_u32(new);
    sum.finish()
}

/// IPv4 header checksum, skipping the checksum field itself
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add_slice(&header[..10]);
    sum.add_slice(&header[12..]);
    sum.finish()
}

/// TCP or UDP checksum over the pseudo-header and `segment`, skipping the
/// checksum field at `csum_off`.
pub fn transport_checksum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
    csum_off: usize,
) -> u16 {
    let mut sum = Checksum::new();
    sum.add_u32(u32::from(src));
    sum.add_u32(u32::from(dst));
    sum.add_u16(protocol as u16);
    sum.add_u16(segment.len() as u16);
    sum.add_slice(&segment[..csum_off]);
    sum.add_slice(&segment[csum_off + 2..]);

    let check = sum.finish();
    if protocol == IpProto::Udp.number() && check == 0 {
        0xffff
    } else {
        check
    }
}

/// Transport segment of an options-free IPv4 frame, bounded by the total
/// length field and the frame itself.
fn segment_bounds(frame: &[u8]) -> Option<(usize, usize)> {
    if frame.len() < L4_OFF || read_u16(frame, ETH_PROTO) != ETH_P_IP {
        return None;
    }
    let tot_len = read_u16(frame, IP_TOT_LEN) as usize;
    let end = (L3_OFF + tot_len).min(frame.len());
    (end >= L4_OFF).then_some((L4_OFF, end))
}

/// Checksum field offset within the segment and minimum segment length
fn transport_csum(protocol: u8) -> Option<(usize, usize)> {
    match IpProto::try_from(protocol).ok()? {
        IpProto::Tcp => Some((TCP_CSUM - L4_OFF, TCP_HLEN)),
        IpProto::Udp => Some((UDP_CSUM - L4_OFF, UDP_HLEN)),
        IpProto::Icmp => None,
    }
}

/// Recompute the IPv4 header checksum and, for TCP and UDP, the transport
/// checksum of an options-free IPv4 frame. Other frames are left untouched.
pub fn fill_checksums(frame: &mut [u8]) {
    let Some((start, end)) = segment_bounds(frame) else {
        return;
    };

    let ip_check = ipv4_header_checksum(&frame[L3_OFF..L4_OFF]);
    frame[IP_CSUM..IP_CSUM + 2].copy_from_slice(&ip_check.to_be_bytes());

    let protocol = frame[IP_PROTO];
    if let Some((off, min_len)) = transport_csum(protocol) {
        if end - start >= min_len {
            let src = read_ipv4(frame, IP_SADDR);
            let dst = read_ipv4(frame, IP_DADDR);
            let check = transport_checksum(src, dst, protocol, &frame[start..end], off);
            frame[start + off..start + off + 2].copy_from_slice(&check.to_be_bytes());
        }
    }
}

/// Whether the frame's checksums match a full recompute. A zero UDP checksum
/// (checksum disabled) is accepted.
pub fn verify_checksums(frame: &[u8]) -> bool {
    let Some((start, end)) = segment_bounds(frame) else {
        return false;
    };
    if read_u16(frame, IP_CSUM) != ipv4_header_checksum(&frame[L3_OFF..L4_OFF]) {
        return false;
    }

    let protocol = frame[IP_PROTO];
    match transport_csum(protocol) {
        Some((off, min_len)) if end - start >= min_len => {
            let stored = read_u16(frame, start + off);
            if protocol == IpProto::Udp.number() && stored == 0 {
                return true;
            }
            let src = read_ipv4(frame, IP_SADDR);
            let dst = read_ipv4(frame, IP_DADDR);
            stored == transport_checksum(src, dst, protocol, &frame[start..end], off)
        }
        Some(_) => false,
        None => true,
    }
}
