//! IPv4 flow tuples
//!
//! One direction of a flow is identified by (protocol, src ip, src port,
//! dst ip, dst port). ICMP flows carry zero ports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::TcgateError;

/// IP protocol numbers the dataplane understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IpProto {
    /// ICMP
    Icmp = 1,
    /// TCP
    Tcp = 6,
    /// UDP
    Udp = 17,
}

impl IpProto {
    /// Protocol number
    #[inline(always)]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Protocol carries ports
    #[inline(always)]
    pub const fn has_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl TryFrom<u8> for IpProto {
    type Error = TcgateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Icmp),
            6 => Ok(Self::Tcp),
            17 => Ok(Self::Udp),
            other => Err(TcgateError::UnsupportedProtocol(other)),
        }
    }
}

impl fmt::Display for IpProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => f.write_str("icmp"),
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// 5-tuple for one direction of an IPv4 flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    /// IP protocol number (not restricted to [`IpProto`])
    pub protocol: u8,
    /// Source address
    pub src_ip: Ipv4Addr,
    /// Destination address
    pub dst_ip: Ipv4Addr,
    /// Source port (0 for ICMP and unknown protocols)
    pub src_port: u16,
    /// Destination port (0 for ICMP and unknown protocols)
    pub dst_port: u16,
}

impl FlowTuple {
    /// Create new flow tuple
    #[inline(always)]
    pub const fn new(
        protocol: u8,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// Source endpoint
    #[inline(always)]
    pub fn src(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_ip, self.src_port)
    }

    /// Destination endpoint
    #[inline(always)]
    pub fn dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_ip, self.dst_port)
    }

    /// Known protocol, if any
    #[inline(always)]
    pub fn proto(&self) -> Option<IpProto> {
        IpProto::try_from(self.protocol).ok()
    }

    /// Reply-direction tuple
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self::new(
            self.protocol,
            self.dst_ip,
            self.dst_port,
            self.src_ip,
            self.src_port,
        )
    }

    /// Same tuple with the destination replaced
    #[inline(always)]
    pub fn with_dst(&self, dst: SocketAddrV4) -> Self {
        Self::new(self.protocol, self.src_ip, self.src_port, *dst.ip(), dst.port())
    }

    /// Same tuple with the source replaced
    #[inline(always)]
    pub fn with_src(&self, src: SocketAddrV4) -> Self {
        Self::new(self.protocol, *src.ip(), src.port(), self.dst_ip, self.dst_port)
    }

    /// FNV-1a hash over the tuple fields, the same for both directions of a
    /// flow
    #[inline(always)]
    pub fn flow_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let (lo, hi) = if self.src() <= self.dst() {
            (self.src(), self.dst())
        } else {
            (self.dst(), self.src())
        };

        let mut h = FNV_OFFSET;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                h ^= *b as u64;
                h = h.wrapping_mul(FNV_PRIME);
            }
        };
        mix(&lo.ip().octets());
        mix(&hi.ip().octets());
        mix(&lo.port().to_be_bytes());
        mix(&hi.port().to_be_bytes());
        mix(&[self.protocol]);
        h
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto() {
            Some(p) => write!(f, "{} {} -> {}", p, self.src(), self.dst()),
            None => write!(f, "proto={} {} -> {}", self.protocol, self.src_ip, self.dst_ip),
        }
    }
}
