//! NAT frontend resolution

use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use tcgate_common::IpProto;

/// Maps a virtual (frontend) endpoint to a real (backend) endpoint.
///
/// Resolution must be deterministic and free of side effects; the pipeline
/// calls it once per new flow.
pub trait NatTable: Send + Sync {
    /// Backend for `(protocol, vip, vport)`, or `None` when not a frontend
    fn resolve(&self, protocol: u8, vip: Ipv4Addr, vport: u16) -> Option<SocketAddrV4>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NatKey {
    protocol: u8,
    addr: SocketAddrV4,
}

impl NatKey {
    fn new(protocol: u8, vip: Ipv4Addr, vport: u16) -> Self {
        // ICMP has no ports; its frontends are keyed by address alone
        let vport = if protocol == IpProto::Icmp.number() { 0 } else { vport };
        Self {
            protocol,
            addr: SocketAddrV4::new(vip, vport),
        }
    }
}

/// Reference [`NatTable`] backed by a concurrent map
#[derive(Debug, Default)]
pub struct NatMap {
    frontends: DashMap<NatKey, SocketAddrV4>,
}

impl NatMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a frontend; returns the previous backend
    pub fn insert(&self, protocol: IpProto, frontend: SocketAddrV4, backend: SocketAddrV4) -> Option<SocketAddrV4> {
        let key = NatKey::new(protocol.number(), *frontend.ip(), frontend.port());
        let backend = if protocol.has_ports() {
            backend
        } else {
            SocketAddrV4::new(*backend.ip(), 0)
        };
        tracing::debug!(%protocol, %frontend, %backend, "NAT frontend installed");
        self.frontends.insert(key, backend)
    }

    /// Remove a frontend
    pub fn remove(&self, protocol: IpProto, frontend: SocketAddrV4) -> Option<SocketAddrV4> {
        let key = NatKey::new(protocol.number(), *frontend.ip(), frontend.port());
        self.frontends.remove(&key).map(|(_, backend)| backend)
    }

    /// Number of frontends
    pub fn len(&self) -> usize {
        self.frontends.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.frontends.is_empty()
    }
}

impl NatTable for NatMap {
    #[inline]
    fn resolve(&self, protocol: u8, vip: Ipv4Addr, vport: u16) -> Option<SocketAddrV4> {
        self.frontends
            .get(&NatKey::new(protocol, vip, vport))
            .map(|backend| *backend)
    }
}
