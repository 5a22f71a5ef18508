//! First-match rule lists
//!
//! The reference [`PolicyProgram`]: an ordered list of rules, the first rule
//! that matches decides. Falling off the end yields `NoMatch`.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tcgate_common::{AttachPoint, IpProto, TcgateError, TcgateResult};

use crate::{PolicyInput, PolicyProgram, PolicyVerdict};

/// Action taken when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Allow the flow
    Allow,
    /// Deny the flow
    Deny,
}

impl From<RuleAction> for PolicyVerdict {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => PolicyVerdict::Allow,
            RuleAction::Deny => PolicyVerdict::Deny,
        }
    }
}

/// Policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule ID (diagnostics only)
    #[serde(default)]
    pub id: u32,
    /// Decision to apply
    pub action: RuleAction,
    /// Protocol (None = any)
    pub protocol: Option<IpProto>,
    /// Source network (None = any)
    pub src_net: Option<Ipv4Network>,
    /// Destination network (None = any)
    pub dst_net: Option<Ipv4Network>,
    /// Source port range, inclusive
    pub src_ports: Option<(u16, u16)>,
    /// Destination port range, inclusive
    pub dst_ports: Option<(u16, u16)>,
    /// Attachment points the rule applies to (empty = all)
    #[serde(default)]
    pub attach: Vec<AttachPoint>,
}

impl PolicyRule {
    /// Create allow-everything rule
    pub fn allow(id: u32) -> Self {
        Self {
            id,
            action: RuleAction::Allow,
            protocol: None,
            src_net: None,
            dst_net: None,
            src_ports: None,
            dst_ports: None,
            attach: Vec::new(),
        }
    }

    /// Create deny-everything rule
    pub fn deny(id: u32) -> Self {
        Self {
            action: RuleAction::Deny,
            ..Self::allow(id)
        }
    }

    /// Match against a policy input
    #[inline]
    pub fn matches(&self, input: &PolicyInput) -> bool {
        let t = &input.tuple;

        if let Some(proto) = self.protocol {
            if t.protocol != proto.number() {
                return false;
            }
        }

        if let Some(net) = self.src_net {
            if !net.contains(t.src_ip) {
                return false;
            }
        }

        if let Some(net) = self.dst_net {
            if !net.contains(t.dst_ip) {
                return false;
            }
        }

        if let Some((start, end)) = self.src_ports {
            if t.src_port < start || t.src_port > end {
                return false;
            }
        }

        if let Some((start, end)) = self.dst_ports {
            if t.dst_port < start || t.dst_port > end {
                return false;
            }
        }

        self.attach.is_empty() || self.attach.contains(&input.attach)
    }

    /// Reject rules that can never match
    pub fn validate(&self) -> TcgateResult<()> {
        for (what, range) in [("src_ports", self.src_ports), ("dst_ports", self.dst_ports)] {
            if let Some((start, end)) = range {
                if start > end {
                    return Err(TcgateError::InvalidPolicy(format!(
                        "rule {}: {} range {}-{} is empty",
                        self.id, what, start, end
                    )));
                }
            }
        }

        let ports = self.src_ports.is_some() || self.dst_ports.is_some();
        if ports && matches!(self.protocol, Some(p) if !p.has_ports()) {
            return Err(TcgateError::InvalidPolicy(format!(
                "rule {}: port match on a protocol without ports",
                self.id
            )));
        }

        Ok(())
    }
}

/// Ordered first-match rule list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleProgram {
    rules: Vec<PolicyRule>,
}

impl RuleProgram {
    /// Build from rules, validating each
    pub fn new(rules: Vec<PolicyRule>) -> TcgateResult<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}

impl PolicyProgram for RuleProgram {
    #[inline]
    fn evaluate(&self, input: &PolicyInput) -> PolicyVerdict {
        self.rules
            .iter()
            .find(|rule| rule.matches(input))
            .map(|rule| rule.action.into())
            .unwrap_or(PolicyVerdict::NoMatch)
    }
}
