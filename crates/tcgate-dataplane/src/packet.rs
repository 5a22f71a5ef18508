//! Header parser
//!
//! Reads Ethernet, IPv4 and the first L4 header out of a frame. The parser
//! never writes to the frame; offsets of the fields the rewriter touches are
//! fixed because IPv4 options are rejected.
//!
//! ```text
//!  0             14                    34                 42        54
//!  ┌─────────────┬─────────────────────┬──────────────────┬─────────┐
//!  │ ethernet    │ ipv4 (ihl = 5)      │ udp / icmp (8)   │ tcp ... │
//!  └─────────────┴─────────────────────┴──────────────────┴─────────┘
//! ```

use std::net::Ipv4Addr;
use tcgate_common::{FlowTuple, IpProto};

use crate::decision::Reason;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;
/// IPv4 header length without options
pub const IPV4_HLEN: usize = 20;
/// UDP header length
pub const UDP_HLEN: usize = 8;
/// TCP header length without options
pub const TCP_HLEN: usize = 20;
/// ICMP header length
pub const ICMP_HLEN: usize = 8;

/// IPv4 ethertype
pub const ETH_P_IP: u16 = 0x0800;

/// Offset of the L3 header in the frame
pub const L3_OFF: usize = ETH_HLEN;
/// Offset of the L4 header in the frame
pub const L4_OFF: usize = ETH_HLEN + IPV4_HLEN;

/// Smallest frame the pipeline accepts: Ethernet + IPv4 + a UDP-sized header
pub const MIN_FRAME_LEN: usize = L4_OFF + UDP_HLEN;
/// Smallest TCP frame
pub const MIN_TCP_FRAME_LEN: usize = L4_OFF + TCP_HLEN;

// Field offsets relative to the start of the frame.
pub(crate) const ETH_DST: usize = 0;
pub(crate) const ETH_SRC: usize = 6;
pub(crate) const ETH_PROTO: usize = 12;
pub(crate) const IP_TOT_LEN: usize = L3_OFF + 2;
pub(crate) const IP_PROTO: usize = L3_OFF + 9;
pub(crate) const IP_CSUM: usize = L3_OFF + 10;
pub(crate) const IP_SADDR: usize = L3_OFF + 12;
pub(crate) const IP_DADDR: usize = L3_OFF + 16;
pub(crate) const L4_SPORT: usize = L4_OFF;
pub(crate) const L4_DPORT: usize = L4_OFF + 2;
pub(crate) const TCP_FLAGS: usize = L4_OFF + 13;
pub(crate) const TCP_CSUM: usize = L4_OFF + 16;
pub(crate) const UDP_CSUM: usize = L4_OFF + 6;

/// ICMP echo reply type
pub const ICMP_ECHOREPLY: u8 = 0;
/// ICMP echo request type
pub const ICMP_ECHO: u8 = 8;

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    /// FIN
    pub const FIN: Self = Self(0x01);
    /// SYN
    pub const SYN: Self = Self(0x02);
    /// RST
    pub const RST: Self = Self(0x04);
    /// ACK
    pub const ACK: Self = Self(0x10);

    /// Build from the raw flags byte
    #[inline(always)]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flags byte
    #[inline(always)]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// All bits of `other` are set
    #[inline(always)]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of two flag sets
    #[inline(always)]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// A bare SYN: the only segment allowed to open a connection
    #[inline(always)]
    pub const fn is_syn_only(&self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

/// L4 details beyond the ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Header {
    /// TCP segment
    Tcp {
        /// Control flags
        flags: TcpFlags,
    },
    /// UDP datagram
    Udp,
    /// ICMP message
    Icmp {
        /// Message type
        icmp_type: u8,
        /// Message code
        code: u8,
    },
    /// Anything else; ports are zero
    Other,
}

impl L4Header {
    /// TCP flags, if this is TCP
    #[inline(always)]
    pub const fn tcp_flags(&self) -> Option<TcpFlags> {
        match self {
            Self::Tcp { flags } => Some(*flags),
            _ => None,
        }
    }
}

/// Parsed view of an IPv4 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    /// Flow tuple as it appears on the wire
    pub tuple: FlowTuple,
    /// IPv4 total length field
    pub ip_tot_len: u16,
    /// L4 details
    pub l4: L4Header,
}

impl ParsedPacket {
    /// Known protocol, if any
    #[inline(always)]
    pub fn proto(&self) -> Option<IpProto> {
        self.tuple.proto()
    }
}

/// Parser result for a well-formed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not IPv4; the pipeline passes it through
    NotIpv4 {
        /// Ethertype found in the frame
        ethertype: u16,
    },
    /// IPv4 frame
    Ipv4(ParsedPacket),
}

#[inline(always)]
pub(crate) fn read_u16(frame: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([frame[off], frame[off + 1]])
}

#[inline(always)]
pub(crate) fn read_ipv4(frame: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(frame[off], frame[off + 1], frame[off + 2], frame[off + 3])
}

/// Parse a frame.
///
/// Fails with [`Reason::Malformed`] for truncated or non-v4 headers and with
/// [`Reason::IpOptions`] when the IPv4 header carries options.
#[inline]
pub fn parse(frame: &[u8]) -> Result<ParseOutcome, Reason> {
    if frame.len() < ETH_HLEN {
        return Err(Reason::Malformed);
    }

    let ethertype = read_u16(frame, ETH_PROTO);
    if ethertype != ETH_P_IP {
        return Ok(ParseOutcome::NotIpv4 { ethertype });
    }

    if frame.len() < MIN_FRAME_LEN {
        return Err(Reason::Malformed);
    }

    let version_ihl = frame[L3_OFF];
    if version_ihl >> 4 != 4 {
        return Err(Reason::Malformed);
    }
    match version_ihl & 0x0f {
        5 => {}
        ihl if ihl < 5 => return Err(Reason::Malformed),
        _ => return Err(Reason::IpOptions),
    }

    let protocol = frame[IP_PROTO];
    let src_ip = read_ipv4(frame, IP_SADDR);
    let dst_ip = read_ipv4(frame, IP_DADDR);

    let (src_port, dst_port, l4) = match IpProto::try_from(protocol) {
        Ok(IpProto::Tcp) => {
            if frame.len() < MIN_TCP_FRAME_LEN {
                return Err(Reason::Malformed);
            }
            (
                read_u16(frame, L4_SPORT),
                read_u16(frame, L4_DPORT),
                L4Header::Tcp {
                    flags: TcpFlags::from_bits(frame[TCP_FLAGS]),
                },
            )
        }
        Ok(IpProto::Udp) => (read_u16(frame, L4_SPORT), read_u16(frame, L4_DPORT), L4Header::Udp),
        Ok(IpProto::Icmp) => (
            0,
            0,
            L4Header::Icmp {
                icmp_type: frame[L4_OFF],
                code: frame[L4_OFF + 1],
            },
        ),
        Err(_) => (0, 0, L4Header::Other),
    };

    Ok(ParseOutcome::Ipv4(ParsedPacket {
        tuple: FlowTuple::new(protocol, src_ip, src_port, dst_ip, dst_port),
        ip_tot_len: read_u16(frame, IP_TOT_LEN),
        l4,
    }))
}
