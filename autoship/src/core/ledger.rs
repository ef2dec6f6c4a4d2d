//! Ledger-owned state transitions.
//!
//! The ledger is the per-project record of every task's attempts and outcome.
//! Only the store actor calls these functions; each successful mutation bumps
//! `version` and stamps `updated_at` so readers always see whole snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::TaskRecord;
use crate::error::StoreError;

/// Attempts after which a failing task is permanently excluded from dispatch.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const DISPATCH_TIMEOUT_ERROR: &str = "dispatch timed out without callback";

/// Per-task execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub description: String,
    pub branch_name: String,
    pub passes: bool,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// Set at dispatch, cleared by complete/fail or by the dispatch timeout.
    #[serde(default)]
    pub in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Identifies the in-flight dispatch; callbacks carrying another id are stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
}

impl LedgerEntry {
    fn fresh(task: &TaskRecord) -> Self {
        Self {
            description: task.description.clone(),
            branch_name: task.branch_name.clone(),
            passes: false,
            attempts: 0,
            last_attempt_at: None,
            error: None,
            pr_url: None,
            in_flight: false,
            dispatched_at: None,
            dispatch_id: None,
        }
    }

    /// True once the task can never be dispatched again.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        self.passes || self.attempts >= max_attempts
    }

    pub fn is_eligible(&self, max_attempts: u32) -> bool {
        !self.is_terminal(max_attempts) && !self.in_flight
    }

    /// A callback without a dispatch id is an operator action and always applies.
    /// One with an id applies only while that dispatch is still in flight.
    fn accepts(&self, dispatch_id: Option<&str>) -> bool {
        match dispatch_id {
            None => true,
            Some(id) => self.in_flight && self.dispatch_id.as_deref() == Some(id),
        }
    }

    fn settle(&mut self, now: DateTime<Utc>) {
        self.in_flight = false;
        self.dispatched_at = None;
        self.dispatch_id = None;
        self.last_attempt_at = Some(now);
    }
}

/// Result of applying a callback to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback<T> {
    Applied(T),
    /// The callback names a dispatch that was reclaimed, re-enqueued or replaced.
    /// The ledger is left untouched.
    Superseded,
}

/// Versioned snapshot of every task known to one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub project_name: String,
    pub tasks: BTreeMap<String, LedgerEntry>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// What `complete` needs from an execution outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    pub pr_url: Option<String>,
    pub learnings: Vec<String>,
    pub files_changed: Vec<String>,
}

/// One block of the append-only progress log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

impl ProgressEntry {
    /// Render as a free-text markdown block for the flat progress log.
    pub fn render(&self) -> String {
        let mut out = format!(
            "## {} - {}\n{}\n",
            self.timestamp.to_rfc3339(),
            self.task_id,
            self.description.trim()
        );
        if !self.learnings.is_empty() {
            out.push_str("\nLearnings:\n");
            for learning in &self.learnings {
                out.push_str(&format!("- {}\n", learning.trim()));
            }
        }
        if !self.files_changed.is_empty() {
            out.push_str("\nFiles changed:\n");
            for file in &self.files_changed {
                out.push_str(&format!("- {file}\n"));
            }
        }
        out.push_str("\n---\n\n");
        out
    }
}

/// A task selected by dispatch, with the entry as it was after marking it in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub task_id: String,
    pub entry: LedgerEntry,
}

impl Ledger {
    pub fn empty(project_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            project_name: project_name.to_string(),
            tasks: BTreeMap::new(),
            version: 0,
            updated_at: now,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Insert or overwrite a task with a fresh attempt history.
    pub fn enqueue(&mut self, task: &TaskRecord, now: DateTime<Utc>) {
        self.tasks.insert(task.id.clone(), LedgerEntry::fresh(task));
        self.touch(now);
    }

    /// Record an execution outcome. Attempts are counted at dispatch, never here.
    ///
    /// Returns the progress entry to append when the outcome carried learnings.
    pub fn complete(
        &mut self,
        task_id: &str,
        dispatch_id: Option<&str>,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<Callback<Option<ProgressEntry>>, StoreError> {
        let entry = self.entry_mut(task_id)?;
        if !entry.accepts(dispatch_id) {
            return Ok(Callback::Superseded);
        }
        entry.passes = completion.success;
        entry.settle(now);
        if completion.pr_url.is_some() {
            entry.pr_url = completion.pr_url.clone();
        }
        if completion.success {
            entry.error = None;
        }
        let progress = (!completion.learnings.is_empty()).then(|| ProgressEntry {
            timestamp: now,
            task_id: task_id.to_string(),
            description: entry.description.clone(),
            learnings: completion.learnings.clone(),
            files_changed: completion.files_changed.clone(),
        });
        self.touch(now);
        Ok(Callback::Applied(progress))
    }

    /// Record a failed attempt.
    ///
    /// A failure that resolves an in-flight dispatch does not count again; the
    /// dispatch already consumed the attempt.
    pub fn fail(
        &mut self,
        task_id: &str,
        dispatch_id: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Callback<()>, StoreError> {
        let entry = self.entry_mut(task_id)?;
        if !entry.accepts(dispatch_id) {
            return Ok(Callback::Superseded);
        }
        if !entry.in_flight {
            entry.attempts += 1;
        }
        entry.passes = false;
        entry.error = Some(error.to_string());
        entry.settle(now);
        self.touch(now);
        Ok(Callback::Applied(()))
    }

    /// Mark the next eligible task in flight under `dispatch_id` and consume one attempt.
    pub fn begin_dispatch(
        &mut self,
        max_attempts: u32,
        dispatch_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Dispatched> {
        let task_id = crate::core::selector::next_eligible(self, max_attempts)?
            .0
            .to_string();
        let entry = self.tasks.get_mut(&task_id)?;
        entry.attempts += 1;
        entry.in_flight = true;
        entry.dispatched_at = Some(now);
        entry.dispatch_id = Some(dispatch_id.to_string());
        entry.last_attempt_at = Some(now);
        let entry = entry.clone();
        self.touch(now);
        Some(Dispatched { task_id, entry })
    }

    /// Release in-flight entries whose callback never arrived within `timeout`.
    ///
    /// The abandoned dispatch id is dropped, so a late callback from it is
    /// superseded. Returns the reclaimed task ids in ledger order.
    pub fn reclaim_stale(&mut self, timeout: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut reclaimed = Vec::new();
        for (id, entry) in &mut self.tasks {
            let Some(dispatched_at) = entry.dispatched_at else {
                continue;
            };
            if entry.in_flight && dispatched_at + timeout <= now {
                entry.error = Some(DISPATCH_TIMEOUT_ERROR.to_string());
                entry.settle(now);
                reclaimed.push(id.clone());
            }
        }
        if !reclaimed.is_empty() {
            self.touch(now);
        }
        reclaimed
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks.values().filter(|e| e.in_flight).count()
    }

    /// True while the dispatch timer still has something to do.
    pub fn has_pending_work(&self, max_attempts: u32) -> bool {
        self.tasks
            .values()
            .any(|e| e.in_flight || e.is_eligible(max_attempts))
    }

    fn entry_mut(&mut self, task_id: &str) -> Result<&mut LedgerEntry, StoreError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }
}
