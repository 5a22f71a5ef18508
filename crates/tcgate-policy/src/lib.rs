//! tcgate Policy Stages
//!
//! Every packet of a new flow is judged by up to four ordered policy stages.
//! Each stage is a pure predicate over the flow tuple and the attachment point
//! and answers with a tri-state verdict.
//!
//! ```text
//!  ┌──────────────┐   ┌──────────┐   ┌──────────────────┐   ┌────────┐
//!  │ do-not-track │──►│ pre-DNAT │──►│ apply-on-forward │──►│ normal │
//!  │ (host ep in) │   │ (new)    │   │ (off by default) │   │ (new)  │
//!  └──────────────┘   └──────────┘   └──────────────────┘   └────────┘
//! ```
//!
//! The stage list is pluggable: any [`PolicyProgram`] can be installed into a
//! slot and swapped atomically while packets are in flight.

#![warn(missing_docs)]

pub mod rules;
pub mod stages;

pub use rules::{PolicyRule, RuleAction, RuleProgram};
pub use stages::{PolicyStage, PolicyStages, StageStats};

use tcgate_common::{AttachPoint, FlowTuple};

/// Result of evaluating one policy stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolicyVerdict {
    /// No rule matched; defer to the next stage or the default
    #[default]
    NoMatch,
    /// Explicitly allowed
    Allow,
    /// Explicitly denied
    Deny,
}

/// What a policy stage gets to look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInput {
    /// Flow tuple as seen by the stage (post-NAT destination for normal policy)
    pub tuple: FlowTuple,
    /// Hook the packet arrived on
    pub attach: AttachPoint,
}

impl PolicyInput {
    /// Create new policy input
    #[inline(always)]
    pub const fn new(tuple: FlowTuple, attach: AttachPoint) -> Self {
        Self { tuple, attach }
    }
}

/// A compiled policy program occupying one stage slot.
///
/// Programs must be side-effect free: the verdict is the only output.
pub trait PolicyProgram: Send + Sync {
    /// Judge one packet
    fn evaluate(&self, input: &PolicyInput) -> PolicyVerdict;
}

impl<F> PolicyProgram for F
where
    F: Fn(&PolicyInput) -> PolicyVerdict + Send + Sync,
{
    #[inline]
    fn evaluate(&self, input: &PolicyInput) -> PolicyVerdict {
        self(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_closure_program() {
        let only_tcp = |input: &PolicyInput| {
            if input.tuple.protocol == 6 {
                PolicyVerdict::Allow
            } else {
                PolicyVerdict::NoMatch
            }
        };

        let tuple = FlowTuple::new(6, Ipv4Addr::LOCALHOST, 1, Ipv4Addr::LOCALHOST, 2);
        let input = PolicyInput::new(tuple, AttachPoint::FromWorkload);
        assert_eq!(only_tcp.evaluate(&input), PolicyVerdict::Allow);

        let input = PolicyInput::new(FlowTuple { protocol: 17, ..tuple }, AttachPoint::FromWorkload);
        assert_eq!(only_tcp.evaluate(&input), PolicyVerdict::NoMatch);
    }

    #[test]
    fn test_default_verdict() {
        assert_eq!(PolicyVerdict::default(), PolicyVerdict::NoMatch);
    }
}
