//! The host agent.
//!
//! Runs on every candidate host: registers it into the pool
//! ([`registration`]), watches its own Host object and drives install /
//! bootstrap / cleanup ([`reconciler`]), keeps OS invariants asserted
//! ([`drift`]), and exposes heartbeat metrics ([`metrics`]). Shell and
//! filesystem access go through the [`cmd`] and [`cloudinit`] seams so the
//! state machine is testable off-host.

pub mod cloudinit;
pub mod cmd;
pub mod drift;
pub mod metrics;
pub mod probe;
pub mod reconciler;
pub mod registration;

pub use cmd::{CmdRunner, ShellRunner};
pub use reconciler::AgentContext;
pub use registration::HostRegistrar;
