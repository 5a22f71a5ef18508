//! In-place NAT rewrites
//!
//! Replaces one endpoint (address, and port for TCP/UDP) of an options-free
//! IPv4 frame and patches both checksums incrementally. The IPv4 header
//! checksum covers the address only; the TCP/UDP checksum covers the address
//! through the pseudo-header plus the port. ICMP has no pseudo-header, so its
//! checksum is left alone.

use std::net::SocketAddrV4;
use tcgate_common::IpProto;

use crate::checksum::{replace_u16, replace_u32};
use crate::decision::Reason;
use crate::packet::{
    read_u16, IP_CSUM, IP_DADDR, IP_SADDR, L4_DPORT, L4_SPORT, MIN_FRAME_LEN, MIN_TCP_FRAME_LEN,
    TCP_CSUM, UDP_CSUM,
};

/// Which endpoint to replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Source address and port
    Source,
    /// Destination address and port
    Destination,
}

impl Endpoint {
    #[inline(always)]
    const fn addr_offset(self) -> usize {
        match self {
            Self::Source => IP_SADDR,
            Self::Destination => IP_DADDR,
        }
    }

    #[inline(always)]
    const fn port_offset(self) -> usize {
        match self {
            Self::Source => L4_SPORT,
            Self::Destination => L4_DPORT,
        }
    }
}

#[inline(always)]
fn read_u32(frame: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]])
}

#[inline(always)]
fn write_u16(frame: &mut [u8], off: usize, value: u16) {
    frame[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

/// Rewrite the destination endpoint
#[inline]
pub fn rewrite_dst(frame: &mut [u8], protocol: u8, to: SocketAddrV4) -> Result<(), Reason> {
    rewrite(frame, protocol, Endpoint::Destination, to)
}

/// Rewrite the source endpoint
#[inline]
pub fn rewrite_src(frame: &mut [u8], protocol: u8, to: SocketAddrV4) -> Result<(), Reason> {
    rewrite(frame, protocol, Endpoint::Source, to)
}

/// Rewrite one endpoint of the frame.
///
/// The frame must already have passed the parser; lengths are re-checked so a
/// short buffer fails with [`Reason::Malformed`] before any byte is written.
pub fn rewrite(
    frame: &mut [u8],
    protocol: u8,
    endpoint: Endpoint,
    to: SocketAddrV4,
) -> Result<(), Reason> {
    let proto = IpProto::try_from(protocol).map_err(|_| Reason::UnsupportedProtocol)?;
    let min_len = match proto {
        IpProto::Tcp => MIN_TCP_FRAME_LEN,
        IpProto::Udp | IpProto::Icmp => MIN_FRAME_LEN,
    };
    if frame.len() < min_len {
        return Err(Reason::Malformed);
    }

    let addr_off = endpoint.addr_offset();
    let old_addr = read_u32(frame, addr_off);
    let new_addr = u32::from(*to.ip());

    let l4_csum_off = match proto {
        IpProto::Tcp => Some(TCP_CSUM),
        IpProto::Udp => Some(UDP_CSUM),
        IpProto::Icmp => None,
    };

    if let Some(csum_off) = l4_csum_off {
        let port_off = endpoint.port_offset();
        let old_port = read_u16(frame, port_off);
        let new_port = to.port();
        let check = read_u16(frame, csum_off);

        // a zero UDP checksum means "not computed" and stays that way
        if !(proto == IpProto::Udp && check == 0) {
            let mut check = replace_u32(check, old_addr, new_addr);
            check = replace_u16(check, old_port, new_port);
            if proto == IpProto::Udp && check == 0 {
                check = 0xffff;
            }
            write_u16(frame, csum_off, check);
        }
        write_u16(frame, port_off, new_port);
    }

    let ip_check = replace_u32(read_u16(frame, IP_CSUM), old_addr, new_addr);
    write_u16(frame, IP_CSUM, ip_check);
    frame[addr_off..addr_off + 4].copy_from_slice(&to.ip().octets());

    Ok(())
}
