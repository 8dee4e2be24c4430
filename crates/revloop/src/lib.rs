//! revloop - review, fix and validate a branch with external coding agents.
//!
//! The [`controller::LoopController`] drives an [`runner::AgentRunner`]
//! through Review → Fix → Validate iterations inside disposable
//! [`workspace::Workspace`] checkouts, persisting every stage report through
//! a [`revloop_core::ReportStore`].

pub mod controller;
pub mod finalizer;
pub mod git;
pub mod runner;
pub mod workspace;

pub use controller::{LoopController, LoopError, LoopSettings, RunOutcome};
pub use finalizer::ExitReason;
pub use runner::{AgentRunner, ProcessRunner, RunnerConfig};
pub use workspace::{Workspace, WorkspaceError, WorkspaceManager};

// Process exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_BUDGET_EXHAUSTED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
/// Internal errors and aborted runs, cancellation included.
pub const EXIT_INTERNAL: i32 = 3;
