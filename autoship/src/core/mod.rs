//! Deterministic, pure logic shared by the agent and the store.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests. Time is
//! always passed in by the caller.

pub mod budget;
pub mod commit_message;
pub mod ledger;
pub mod learnings;
pub mod selector;
pub mod types;
