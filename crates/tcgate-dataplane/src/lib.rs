//! tcgate Dataplane
//!
//! Per-packet forwarding decision engine. Every IPv4 frame crossing a
//! workload or host-endpoint hook is parsed once, judged by the policy stages,
//! matched against connection tracking, translated if a NAT frontend claims
//! it, and finally either redirected straight to its egress interface or
//! handed back to the stack.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              PIPELINE                                │
//! │                                                                      │
//! │  frame ─► parse ─► do-not-track ─► conntrack lookup                  │
//! │            │          (host ep)        │                             │
//! │       non-IPv4        allow ──┐    ┌───┴──────────────┐              │
//! │       passthrough             │    │ new              │ established  │
//! │                               │    ▼                  ▼              │
//! │                               │  pre-DNAT          apply recorded    │
//! │                               │  NAT resolve       DNAT / SNAT       │
//! │                               │  normal policy        │              │
//! │                               │  conntrack create     │              │
//! │                               │    │                  │              │
//! │                               ▼    ▼                  ▼              │
//! │                            rewrite + incremental checksums           │
//! │                                       │                              │
//! │                                       ▼                              │
//! │                         FIB lookup ─► redirect | fallback            │
//! │                                       │                              │
//! │                              workload origin mark                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every collaborator sits behind a trait ([`ConntrackTable`], [`NatTable`],
//! [`FibOracle`], [`tcgate_policy::PolicyProgram`]) with an in-process
//! reference implementation.
//!
//! # Key Properties
//!
//! 1. **Run-to-Completion**: one forward pass per packet, no backtracking
//! 2. **No per-packet allocation**: the parsed context lives on the stack
//! 3. **Sharded shared state**: conntrack and NAT are concurrent maps
//! 4. **Deny is terminal**: nothing is written after a drop decision

#![warn(missing_docs)]

pub mod checksum;
pub mod config;
pub mod conntrack;
pub mod core;
pub mod decision;
pub mod fib;
pub mod nat;
pub mod packet;
pub mod pipeline;
pub mod rewrite;
pub mod stats;

pub use crate::core::{Engine, EngineConfig, EngineError, PacketJob, PacketResult};
pub use config::{ConfigError, DataplaneConfig};
pub use conntrack::{ConntrackError, ConntrackMap, ConntrackTable, CtEntry, CtLookup};
pub use decision::{Decision, FibStatus, Reason, TcAction};
pub use fib::{FibError, FibOracle, FibParams, FibResult, MacAddr, StaticFib};
pub use nat::{NatMap, NatTable};
pub use packet::{L4Header, ParseOutcome, ParsedPacket, TcpFlags};
pub use pipeline::Dataplane;
pub use stats::{DataplaneStats, DataplaneStatsSnapshot};

/// Default connection table capacity
pub const DEFAULT_CONNTRACK_CAPACITY: usize = 1 << 20; // 1M entries

/// Default depth of the engine's job queue
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;
