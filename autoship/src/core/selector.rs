//! Deterministic selection logic for the ledger.

use crate::core::ledger::{Ledger, LedgerEntry};

/// Find the first task, in ledger order, that may be dispatched.
///
/// Passed tasks, exhausted tasks and tasks already in flight are skipped.
/// Returns `None` when nothing is eligible.
pub fn next_eligible(ledger: &Ledger, max_attempts: u32) -> Option<(&str, &LedgerEntry)> {
    ledger
        .tasks
        .iter()
        .find(|(_, entry)| entry.is_eligible(max_attempts))
        .map(|(id, entry)| (id.as_str(), entry))
}

/// Returns true if a task is exhausted (attempts used up without passing).
pub fn is_exhausted(entry: &LedgerEntry, max_attempts: u32) -> bool {
    !entry.passes && entry.attempts >= max_attempts
}
