//! Attachment points
//!
//! The pipeline is hooked into four places. Each is identified only by two
//! bits: whether the packet is entering the host namespace through the hook
//! (`INGRESS`) and whether the far side is a host endpoint rather than a
//! workload (`HOST_EP`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a packet entered the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPoint {
    /// Workload to host namespace
    FromWorkload,
    /// Host namespace to workload
    ToWorkload,
    /// External network to host, through a host endpoint
    FromHostEndpoint,
    /// Host to external network, through a host endpoint
    ToHostEndpoint,
}

impl AttachPoint {
    /// All attachment points, in hook order
    pub const ALL: [AttachPoint; 4] = [
        Self::FromWorkload,
        Self::ToWorkload,
        Self::FromHostEndpoint,
        Self::ToHostEndpoint,
    ];

    /// Ingress flag of the hook
    #[inline(always)]
    pub const fn is_ingress(&self) -> bool {
        matches!(self, Self::ToWorkload | Self::FromHostEndpoint)
    }

    /// Host-endpoint flag of the hook
    #[inline(always)]
    pub const fn is_host_endpoint(&self) -> bool {
        matches!(self, Self::FromHostEndpoint | Self::ToHostEndpoint)
    }

    /// Traffic is heading into the host namespace and is a candidate for a
    /// short-circuit forwarding lookup.
    #[inline(always)]
    pub const fn towards_host(&self) -> bool {
        (self.is_host_endpoint() && self.is_ingress())
            || (!self.is_host_endpoint() && !self.is_ingress())
    }

    /// Traffic is leaving a workload and must carry the origin mark.
    #[inline(always)]
    pub const fn from_workload(&self) -> bool {
        !self.is_host_endpoint() && !self.is_ingress()
    }

    /// Stable name used in config files and logs
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FromWorkload => "from_workload",
            Self::ToWorkload => "to_workload",
            Self::FromHostEndpoint => "from_host_endpoint",
            Self::ToHostEndpoint => "to_host_endpoint",
        }
    }
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachPoint {
    type Err = crate::TcgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| crate::TcgateError::UnknownAttachPoint(s.to_string()))
    }
}
