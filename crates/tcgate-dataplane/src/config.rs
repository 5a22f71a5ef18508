//! Dataplane configuration
//!
//! A single JSON document describes everything needed to stand up a
//! [`Dataplane`]: worker pool sizing, conntrack capacity, the origin mark,
//! policy rule lists per stage, NAT frontends and the static FIB.
//!
//! ```json
//! {
//!   "workers": 4,
//!   "policy": { "normal": [{ "action": "allow", "protocol": "tcp" }] },
//!   "nat": [{ "protocol": "tcp", "frontend": "10.0.0.100:80", "backend": "10.0.1.7:8080" }],
//!   "fib": {
//!     "interfaces": [{ "ifindex": 5, "mac": "02:00:00:00:00:05" }],
//!     "routes": [{ "dest": "10.0.1.0/24", "ifindex": 5 }],
//!     "neighbors": [{ "ip": "10.0.1.7", "mac": "0a:00:00:00:01:07" }]
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;
use tcgate_common::{IpProto, TcgateError, WorkloadMark};
use tcgate_policy::{PolicyRule, PolicyStage, PolicyStages, RuleProgram};

use crate::conntrack::ConntrackMap;
use crate::core::EngineConfig;
use crate::fib::{MacAddr, Route, StaticFib};
use crate::nat::NatMap;
use crate::pipeline::Dataplane;
use crate::{DEFAULT_CONNTRACK_CAPACITY, DEFAULT_QUEUE_DEPTH};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Not valid JSON for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Parsed, but inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),

    /// A rule list was rejected
    #[error(transparent)]
    Policy(#[from] TcgateError),
}

/// Top-level dataplane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// Engine worker threads
    pub workers: usize,
    /// Engine job queue depth
    pub queue_depth: usize,
    /// Maximum conntrack entries
    pub conntrack_capacity: usize,
    /// Origin mark for workload traffic
    pub workload_mark: WorkloadMark,
    /// Enable the apply-on-forward stage
    pub apply_on_forward: bool,
    /// Policy rules
    pub policy: PolicyConfig,
    /// NAT frontends
    pub nat: Vec<NatFrontend>,
    /// Static FIB contents
    pub fib: FibConfig,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            workers: EngineConfig::default().num_workers,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            conntrack_capacity: DEFAULT_CONNTRACK_CAPACITY,
            workload_mark: WorkloadMark::default(),
            apply_on_forward: false,
            policy: PolicyConfig::default(),
            nat: Vec::new(),
            fib: FibConfig::default(),
        }
    }
}

/// Rule lists per stage; an empty list leaves the stage unset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Host ingress, before conntrack
    pub do_not_track: Vec<PolicyRule>,
    /// New flows, on the pre-NAT tuple
    pub pre_dnat: Vec<PolicyRule>,
    /// New flows, on the post-NAT tuple
    pub apply_on_forward: Vec<PolicyRule>,
    /// Workload policy
    pub normal: Vec<PolicyRule>,
}

impl PolicyConfig {
    fn stages(&self) -> [(PolicyStage, &[PolicyRule]); 4] {
        [
            (PolicyStage::DoNotTrack, self.do_not_track.as_slice()),
            (PolicyStage::PreDnat, self.pre_dnat.as_slice()),
            (PolicyStage::ApplyOnForward, self.apply_on_forward.as_slice()),
            (PolicyStage::Normal, self.normal.as_slice()),
        ]
    }
}

/// One NAT frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatFrontend {
    /// Transport protocol
    pub protocol: IpProto,
    /// Virtual address
    pub frontend: SocketAddrV4,
    /// Real address
    pub backend: SocketAddrV4,
}

/// Static forwarding table contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FibConfig {
    /// Local interfaces
    pub interfaces: Vec<InterfaceConfig>,
    /// Prefix routes
    pub routes: Vec<Route>,
    /// Resolved neighbours
    pub neighbors: Vec<NeighborConfig>,
}

/// Interface known to the FIB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface index
    pub ifindex: u32,
    /// Interface address
    pub mac: MacAddr,
}

/// Resolved neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborConfig {
    /// Neighbour address
    pub ip: Ipv4Addr,
    /// Its link-layer address
    pub mac: MacAddr,
}

impl DataplaneConfig {
    /// Load and validate from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check values the type system does not
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be non-zero".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be non-zero".into()));
        }
        if self.conntrack_capacity == 0 {
            return Err(ConfigError::Invalid("conntrack_capacity must be non-zero".into()));
        }
        if !self.workload_mark.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "workload mark {:#x} has bits outside mask {:#x}",
                self.workload_mark.value, self.workload_mark.mask
            )));
        }

        for (_, rules) in self.policy.stages() {
            for rule in rules {
                rule.validate()?;
            }
        }

        let mut frontends = HashSet::new();
        for nat in &self.nat {
            let port = if nat.protocol.has_ports() { nat.frontend.port() } else { 0 };
            if !frontends.insert((nat.protocol, *nat.frontend.ip(), port)) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate {} NAT frontend {}",
                    nat.protocol, nat.frontend
                )));
            }
        }

        let interfaces: HashSet<u32> = self.fib.interfaces.iter().map(|i| i.ifindex).collect();
        for route in &self.fib.routes {
            if !interfaces.contains(&route.ifindex) {
                return Err(ConfigError::Invalid(format!(
                    "route {} uses unknown interface {}",
                    route.dest, route.ifindex
                )));
            }
        }

        Ok(())
    }

    /// Policy stages with every configured rule list installed
    pub fn policy_stages(&self) -> Result<PolicyStages, ConfigError> {
        let stages = PolicyStages::new();
        for (stage, rules) in self.policy.stages() {
            if rules.is_empty() {
                continue;
            }
            let program = RuleProgram::new(rules.to_vec())?;
            stages.install(stage, format!("{}-rules", stage), program);
        }
        stages.set_enabled(PolicyStage::ApplyOnForward, self.apply_on_forward);
        Ok(stages)
    }

    /// NAT frontends
    pub fn nat_map(&self) -> NatMap {
        let map = NatMap::new();
        for nat in &self.nat {
            map.insert(nat.protocol, nat.frontend, nat.backend);
        }
        map
    }

    /// Static FIB
    pub fn static_fib(&self) -> StaticFib {
        let fib = StaticFib::new();
        for iface in &self.fib.interfaces {
            fib.add_interface(iface.ifindex, iface.mac);
        }
        for route in &self.fib.routes {
            fib.add_route(*route);
        }
        for neighbor in &self.fib.neighbors {
            fib.add_neighbor(neighbor.ip, neighbor.mac);
        }
        fib
    }

    /// Build a dataplane over the reference stores
    pub fn build_dataplane(&self) -> Result<Dataplane, ConfigError> {
        self.validate()?;
        let dataplane = Dataplane::new(
            Arc::new(self.policy_stages()?),
            Arc::new(ConntrackMap::new(self.conntrack_capacity)),
            Arc::new(self.nat_map()),
            Arc::new(self.static_fib()),
        )
        .with_mark(self.workload_mark);

        tracing::info!(
            conntrack_capacity = self.conntrack_capacity,
            nat_frontends = self.nat.len(),
            routes = self.fib.routes.len(),
            apply_on_forward = self.apply_on_forward,
            "dataplane built"
        );
        Ok(dataplane)
    }

    /// Engine sizing
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            num_workers: self.workers,
            queue_depth: self.queue_depth,
        }
    }
}
