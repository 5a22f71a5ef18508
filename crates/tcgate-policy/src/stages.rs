//! Pluggable, hot-swappable policy stage list

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tcgate_common::AtomicCounter;

use crate::{PolicyInput, PolicyProgram, PolicyVerdict};

/// The four policy evaluation points, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStage {
    /// Host-endpoint ingress, before connection tracking
    DoNotTrack = 0,
    /// New flows, before destination NAT
    PreDnat = 1,
    /// New flows that are forwarded rather than locally destined
    ApplyOnForward = 2,
    /// New flows, after NAT resolution; no match means deny
    Normal = 3,
}

impl PolicyStage {
    /// All stages in evaluation order
    pub const ALL: [PolicyStage; 4] = [
        Self::DoNotTrack,
        Self::PreDnat,
        Self::ApplyOnForward,
        Self::Normal,
    ];

    /// Stable stage name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DoNotTrack => "do_not_track",
            Self::PreDnat => "pre_dnat",
            Self::ApplyOnForward => "apply_on_forward",
            Self::Normal => "normal",
        }
    }

    /// Stages are enabled on creation except apply-on-forward
    pub const fn enabled_by_default(&self) -> bool {
        !matches!(self, Self::ApplyOnForward)
    }
}

impl fmt::Display for PolicyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A program installed in a slot, with the name it was installed under
struct InstalledProgram {
    name: String,
    program: Box<dyn PolicyProgram>,
}

struct StageSlot {
    program: ArcSwapOption<InstalledProgram>,
    enabled: AtomicBool,
    allowed: AtomicCounter,
    denied: AtomicCounter,
    no_match: AtomicCounter,
}

impl StageSlot {
    fn new(stage: PolicyStage) -> Self {
        Self {
            program: ArcSwapOption::empty(),
            enabled: AtomicBool::new(stage.enabled_by_default()),
            allowed: AtomicCounter::new(0),
            denied: AtomicCounter::new(0),
            no_match: AtomicCounter::new(0),
        }
    }
}

/// Ordered policy stage list.
///
/// Slots are read lock-free on the packet path; installs and removals swap
/// the whole program atomically, so an in-flight packet sees either the old
/// or the new program, never a mix.
pub struct PolicyStages {
    slots: [StageSlot; 4],
    version: AtomicU64,
}

impl PolicyStages {
    /// Create with every slot empty
    pub fn new() -> Self {
        Self {
            slots: PolicyStage::ALL.map(StageSlot::new),
            version: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    fn slot(&self, stage: PolicyStage) -> &StageSlot {
        &self.slots[stage as usize]
    }

    /// Install (or replace) the program for a stage
    pub fn install<P>(&self, stage: PolicyStage, name: impl Into<String>, program: P)
    where
        P: PolicyProgram + 'static,
    {
        let name = name.into();
        tracing::info!(stage = %stage, program = %name, "installing policy program");
        self.slot(stage).program.store(Some(Arc::new(InstalledProgram {
            name,
            program: Box::new(program),
        })));
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Remove the program for a stage; the stage then yields `NoMatch`
    pub fn clear(&self, stage: PolicyStage) {
        tracing::info!(stage = %stage, "clearing policy program");
        self.slot(stage).program.store(None);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Enable or disable a stage without touching its program
    pub fn set_enabled(&self, stage: PolicyStage, enabled: bool) {
        tracing::info!(stage = %stage, enabled, "policy stage toggled");
        self.slot(stage).enabled.store(enabled, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Whether a stage is consulted at all
    #[inline(always)]
    pub fn is_enabled(&self, stage: PolicyStage) -> bool {
        self.slot(stage).enabled.load(Ordering::Acquire)
    }

    /// Name of the program installed in a stage
    pub fn program_name(&self, stage: PolicyStage) -> Option<String> {
        let guard = self.slot(stage).program.load();
        match &*guard {
            Some(installed) => Some(installed.name.clone()),
            None => None,
        }
    }

    /// Configuration generation; bumped by every install, clear and toggle
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Evaluate one stage. Disabled or empty stages yield `NoMatch`.
    #[inline]
    pub fn evaluate(&self, stage: PolicyStage, input: &PolicyInput) -> PolicyVerdict {
        let slot = self.slot(stage);
        if !slot.enabled.load(Ordering::Acquire) {
            return PolicyVerdict::NoMatch;
        }

        let guard = slot.program.load();
        let verdict = match &*guard {
            Some(installed) => installed.program.evaluate(input),
            None => PolicyVerdict::NoMatch,
        };

        match verdict {
            PolicyVerdict::Allow => slot.allowed.inc(),
            PolicyVerdict::Deny => slot.denied.inc(),
            PolicyVerdict::NoMatch => slot.no_match.inc(),
        };

        verdict
    }

    /// Per-stage evaluation counters
    pub fn stats(&self) -> Vec<StageStats> {
        PolicyStage::ALL
            .iter()
            .map(|stage| {
                let slot = self.slot(*stage);
                StageStats {
                    stage: *stage,
                    enabled: slot.enabled.load(Ordering::Relaxed),
                    program: self.program_name(*stage),
                    allowed: slot.allowed.get(),
                    denied: slot.denied.get(),
                    no_match: slot.no_match.get(),
                }
            })
            .collect()
    }
}

impl Default for PolicyStages {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage statistics
#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    /// Stage these counters belong to
    pub stage: PolicyStage,
    /// A program is installed
    pub enabled: bool,
    /// Name of the installed program
    pub program: Option<String>,
    /// Allow verdicts
    pub allowed: u64,
    /// Deny verdicts
    pub denied: u64,
    /// Evaluations that matched no rule
    pub no_match: u64,
}
