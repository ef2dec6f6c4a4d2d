//! Backlog-to-branch automation: a durable task ledger driving an isolated,
//! quality-gated coding-agent pipeline.
//!
//! The crate keeps the same strict separation on both sides of the wire:
//!
//! - **[`core`]**: Pure, deterministic logic (ledger transitions, selection,
//!   learnings mining, commit messages, wire types). No I/O.
//! - **[`io`]**: Side-effecting adapters (git worktrees, subprocesses, the quality
//!   gate, the coding-agent backend, persistence, HTTP delivery).
//!
//! Two orchestration modules tie them together: [`execution`] runs one task
//! through the worktree → agent → quality gate → commit/push pipeline, and
//! [`store`] is the single-writer ledger actor that dispatches work to it.

pub mod core;
pub mod error;
pub mod execution;
pub mod io;
pub mod logging;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
