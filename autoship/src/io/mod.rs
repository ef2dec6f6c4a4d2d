//! Side-effecting adapters: git, subprocesses, the quality gate, the coding
//! agent, persistence, configuration and HTTP delivery.

pub mod agent;
pub mod config;
pub mod git;
pub mod http;
pub mod ledger_store;
pub mod process;
pub mod prompt;
pub mod quality;
pub mod worktree;
