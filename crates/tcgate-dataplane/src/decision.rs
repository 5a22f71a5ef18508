//! Pipeline outcomes
//!
//! The attaching layer only ever sees a coarse [`TcAction`]. The [`Reason`]
//! travels alongside for counters, logs and tests.

use serde::Serialize;
use std::fmt;

/// Coarse action handed back to the attaching layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "ifindex")]
pub enum TcAction {
    /// Let the stack handle the packet as usual
    Unspec,
    /// Drop the packet
    Shot,
    /// Transmit directly out of the given interface
    Redirect(u32),
}

impl TcAction {
    /// Stable action name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unspec => "unspec",
            Self::Shot => "shot",
            Self::Redirect(_) => "redirect",
        }
    }
}

/// Why the pipeline reached its decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Reason {
    /// Not IPv4; handed back untouched
    NotIpv4 = 0,
    /// Truncated or structurally invalid headers
    Malformed = 1,
    /// IPv4 header carries options
    IpOptions = 2,
    /// L4 protocol other than TCP, UDP or ICMP
    UnsupportedProtocol = 3,
    /// Do-not-track policy allowed the packet
    DoNotTrackAllow = 4,
    /// Do-not-track policy denied the packet
    DoNotTrackDeny = 5,
    /// Pre-DNAT policy denied the new flow
    PreDnatDeny = 6,
    /// Apply-on-forward policy denied the new flow
    ApplyOnForwardDeny = 7,
    /// Normal policy denied the new flow
    PolicyDeny = 8,
    /// Normal policy had no opinion; default deny
    PolicyNoMatch = 9,
    /// No connection entry and the packet cannot open one
    CtInvalid = 10,
    /// Connection table at capacity
    TableFull = 11,
    /// Lost an insert race against a conflicting entry
    InsertRace = 12,
    /// New flow accepted
    NewFlow = 13,
    /// New flow accepted with destination NAT
    NewFlowNat = 14,
    /// Existing flow
    Established = 15,
    /// Existing flow, destination translated
    EstablishedDnat = 16,
    /// Existing flow, source translated back
    EstablishedSnat = 17,
}

impl Reason {
    /// Number of reasons
    pub const COUNT: usize = 18;

    /// All reasons, indexed by discriminant
    pub const ALL: [Reason; Self::COUNT] = [
        Self::NotIpv4,
        Self::Malformed,
        Self::IpOptions,
        Self::UnsupportedProtocol,
        Self::DoNotTrackAllow,
        Self::DoNotTrackDeny,
        Self::PreDnatDeny,
        Self::ApplyOnForwardDeny,
        Self::PolicyDeny,
        Self::PolicyNoMatch,
        Self::CtInvalid,
        Self::TableFull,
        Self::InsertRace,
        Self::NewFlow,
        Self::NewFlowNat,
        Self::Established,
        Self::EstablishedDnat,
        Self::EstablishedSnat,
    ];

    /// Index into per-reason counter arrays
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stable reason name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotIpv4 => "not_ipv4",
            Self::Malformed => "malformed",
            Self::IpOptions => "ip_options",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::DoNotTrackAllow => "do_not_track_allow",
            Self::DoNotTrackDeny => "do_not_track_deny",
            Self::PreDnatDeny => "pre_dnat_deny",
            Self::ApplyOnForwardDeny => "apply_on_forward_deny",
            Self::PolicyDeny => "policy_deny",
            Self::PolicyNoMatch => "policy_no_match",
            Self::CtInvalid => "ct_invalid",
            Self::TableFull => "table_full",
            Self::InsertRace => "insert_race",
            Self::NewFlow => "new_flow",
            Self::NewFlowNat => "new_flow_nat",
            Self::Established => "established",
            Self::EstablishedDnat => "established_dnat",
            Self::EstablishedSnat => "established_snat",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened at the forwarding step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FibStatus {
    /// Not consulted: dropped, passthrough, or not heading into the host
    #[default]
    Skipped,
    /// Route found; MACs rewritten and redirected
    Redirected,
    /// Oracle rejected the lookup parameters
    BadInput,
    /// Oracle has no usable route
    NoRoute,
}

/// Final result of one pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Action for the attaching layer
    #[serde(flatten)]
    pub action: TcAction,
    /// Diagnostic reason
    pub reason: Reason,
    /// Forwarding step outcome
    pub fib: FibStatus,
}

impl Decision {
    /// Drop with a reason
    #[inline(always)]
    pub const fn shot(reason: Reason) -> Self {
        Self {
            action: TcAction::Shot,
            reason,
            fib: FibStatus::Skipped,
        }
    }

    /// Accept without a forwarding lookup
    #[inline(always)]
    pub const fn unspec(reason: Reason) -> Self {
        Self {
            action: TcAction::Unspec,
            reason,
            fib: FibStatus::Skipped,
        }
    }

    /// Accept after a failed forwarding lookup
    #[inline(always)]
    pub const fn fallback(reason: Reason, fib: FibStatus) -> Self {
        Self {
            action: TcAction::Unspec,
            reason,
            fib,
        }
    }

    /// Redirect to an egress interface
    #[inline(always)]
    pub const fn redirect(ifindex: u32, reason: Reason) -> Self {
        Self {
            action: TcAction::Redirect(ifindex),
            reason,
            fib: FibStatus::Redirected,
        }
    }

    /// The packet is dropped
    #[inline(always)]
    pub const fn is_drop(&self) -> bool {
        matches!(self.action, TcAction::Shot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_index_matches_table() {
        for (i, reason) in Reason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }

    #[test]
    fn test_decision_json() {
        let json = serde_json::to_value(Decision::redirect(7, Reason::NewFlowNat)).unwrap();
        assert_eq!(json["action"], "redirect");
        assert_eq!(json["ifindex"], 7);
        assert_eq!(json["reason"], "new_flow_nat");
        assert_eq!(json["fib"], "redirected");

        let json = serde_json::to_value(Decision::shot(Reason::Malformed)).unwrap();
        assert_eq!(json["action"], "shot");
        assert!(json.get("ifindex").is_none());
    }
}
