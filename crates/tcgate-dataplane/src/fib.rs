//! Forwarding oracle
//!
//! Next-hop resolution for packets heading into the host namespace. A hit
//! yields the egress interface and the MAC pair to stamp on the frame; a miss
//! is never a drop, the pipeline falls back to the regular stack.

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::packet::IPV4_HLEN;

/// Ethernet address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(':');
        for byte in mac.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("invalid MAC address: {}", s))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| format!("invalid MAC address: {}", s))?;
        }
        if parts.next().is_some() {
            return Err(format!("invalid MAC address: {}", s));
        }
        Ok(Self(mac))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Lookup key handed to the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibParams {
    /// IP protocol number
    pub protocol: u8,
    /// Source address
    pub src_ip: Ipv4Addr,
    /// Destination address, after DNAT
    pub dst_ip: Ipv4Addr,
    /// Source port, 0 for ICMP
    pub src_port: u16,
    /// Destination port, 0 for ICMP
    pub dst_port: u16,
    /// Interface the packet arrived on
    pub ifindex: u32,
    /// IPv4 total length
    pub tot_len: u16,
}

/// Successful lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibResult {
    /// Egress interface
    pub ifindex: u32,
    /// Source MAC to stamp (egress interface address)
    pub smac: MacAddr,
    /// Destination MAC to stamp (next hop)
    pub dmac: MacAddr,
}

/// Lookup failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FibError {
    /// The oracle refused the parameters
    #[error("invalid lookup input: {0}")]
    BadInput(&'static str),

    /// No route, or the next hop is unresolved
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),
}

/// Next-hop resolution contract
pub trait FibOracle: Send + Sync {
    /// Resolve the egress interface and MACs for a packet
    fn lookup(&self, params: &FibParams) -> Result<FibResult, FibError>;
}

/// One route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination prefix
    pub dest: Ipv4Network,
    /// Egress interface
    pub ifindex: u32,
    /// Next-hop gateway; `None` for on-link prefixes
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

/// Static routing table with a neighbour cache
#[derive(Default)]
pub struct StaticFib {
    /// Sorted longest prefix first
    routes: RwLock<Vec<Route>>,
    interfaces: RwLock<HashMap<u32, MacAddr>>,
    neighbors: DashMap<Ipv4Addr, MacAddr>,
}

impl StaticFib {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface and its MAC
    pub fn add_interface(&self, ifindex: u32, mac: MacAddr) {
        self.interfaces.write().insert(ifindex, mac);
    }

    /// Add a route, replacing any route for the same prefix
    pub fn add_route(&self, route: Route) {
        let mut routes = self.routes.write();
        routes.retain(|r| r.dest != route.dest);
        routes.push(route);
        routes.sort_by(|a, b| b.dest.prefix().cmp(&a.dest.prefix()));
    }

    /// Remove the route for a prefix
    pub fn remove_route(&self, dest: Ipv4Network) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.dest != dest);
        routes.len() != before
    }

    /// Learn or refresh a neighbour
    pub fn add_neighbor(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.neighbors.insert(ip, mac);
    }

    /// Forget a neighbour
    pub fn remove_neighbor(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.neighbors.remove(&ip).map(|(_, mac)| mac)
    }

    /// Number of routes
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Longest-prefix match
    pub fn route_for(&self, dst: Ipv4Addr) -> Option<Route> {
        self.routes.read().iter().find(|r| r.dest.contains(dst)).copied()
    }
}

impl FibOracle for StaticFib {
    fn lookup(&self, params: &FibParams) -> Result<FibResult, FibError> {
        if params.ifindex == 0 {
            return Err(FibError::BadInput("ingress ifindex is zero"));
        }
        if (params.tot_len as usize) < IPV4_HLEN {
            return Err(FibError::BadInput("total length shorter than an IPv4 header"));
        }
        if !self.interfaces.read().contains_key(&params.ifindex) {
            return Err(FibError::BadInput("unknown ingress interface"));
        }

        let route = self
            .route_for(params.dst_ip)
            .ok_or(FibError::NoRoute(params.dst_ip))?;
        let smac = self
            .interfaces
            .read()
            .get(&route.ifindex)
            .copied()
            .ok_or(FibError::NoRoute(params.dst_ip))?;

        let next_hop = route.gateway.unwrap_or(params.dst_ip);
        let dmac = self
            .neighbors
            .get(&next_hop)
            .map(|mac| *mac)
            .ok_or(FibError::NoRoute(params.dst_ip))?;

        Ok(FibResult {
            ifindex: route.ifindex,
            smac,
            dmac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETH0: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x10]);
    const VETH: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x20]);
    const GW: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);
    const POD: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x07]);

    fn fib() -> StaticFib {
        let fib = StaticFib::new();
        fib.add_interface(2, ETH0);
        fib.add_interface(5, VETH);
        fib.add_route(Route {
            dest: "0.0.0.0/0".parse().unwrap(),
            ifindex: 2,
            gateway: Some(Ipv4Addr::new(192, 168, 0, 1)),
        });
        fib.add_route(Route {
            dest: "10.0.1.0/24".parse().unwrap(),
            ifindex: 5,
            gateway: None,
        });
        fib.add_neighbor(Ipv4Addr::new(192, 168, 0, 1), GW);
        fib.add_neighbor(Ipv4Addr::new(10, 0, 1, 7), POD);
        fib
    }

    fn params(dst: [u8; 4]) -> FibParams {
        FibParams {
            protocol: 6,
            src_ip: Ipv4Addr::new(10, 0, 0, 5),
            dst_ip: Ipv4Addr::from(dst),
            src_port: 43210,
            dst_port: 8080,
            ifindex: 2,
            tot_len: 60,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let res = fib().lookup(&params([10, 0, 1, 7])).unwrap();
        assert_eq!(res, FibResult { ifindex: 5, smac: VETH, dmac: POD });

        let res = fib().lookup(&params([8, 8, 8, 8])).unwrap();
        assert_eq!(res, FibResult { ifindex: 2, smac: ETH0, dmac: GW });
    }

    #[test]
    fn test_bad_input() {
        let fib = fib();
        let mut p = params([10, 0, 1, 7]);
        p.ifindex = 0;
        assert!(matches!(fib.lookup(&p), Err(FibError::BadInput(_))));

        p.ifindex = 99;
        assert!(matches!(fib.lookup(&p), Err(FibError::BadInput(_))));

        p.ifindex = 2;
        p.tot_len = 19;
        assert!(matches!(fib.lookup(&p), Err(FibError::BadInput(_))));
    }

    #[test]
    fn test_no_route() {
        let fib = fib();
        // unresolved neighbour on the pod subnet
        assert_eq!(
            fib.lookup(&params([10, 0, 1, 8])),
            Err(FibError::NoRoute(Ipv4Addr::new(10, 0, 1, 8)))
        );

        assert!(fib.remove_route("0.0.0.0/0".parse().unwrap()));
        assert_eq!(fib.route_count(), 1);
        assert!(matches!(fib.lookup(&params([8, 8, 8, 8])), Err(FibError::NoRoute(_))));
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddr = "02:00:00:00:00:fe".parse().unwrap();
        assert_eq!(mac, GW);
        assert_eq!(mac.to_string(), "02:00:00:00:00:fe");
        assert!("02:00:00:00:00".parse::<MacAddr>().is_err());
        assert!("02:00:00:00:00:00:01".parse::<MacAddr>().is_err());
        assert!("zz:00:00:00:00:00".parse::<MacAddr>().is_err());

        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"02:00:00:00:00:fe\"");
        assert_eq!(serde_json::from_str::<MacAddr>(&json).unwrap(), mac);
    }
}
