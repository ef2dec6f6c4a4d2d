//! Wire contracts between the store and the execution agent.
//!
//! Payloads arrive as loosely-shaped JSON. Each inbound shape has a `*Body`
//! twin with every field optional; `validate`/`normalize` turn it into the
//! fixed internal record (applying defaults) or report every missing field.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Agent invocations per execution when neither side configures a limit.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Request to run one task through the execution pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub task_id: String,
    pub repo_url: String,
    pub base_branch: String,
    pub branch_name: String,
    pub prompt: String,
    pub max_iterations: u32,
    pub callback_url: String,
    /// Accumulated progress log of the project; only its tail reaches the prompt.
    #[serde(default)]
    pub progress_log: String,
    /// Store-side dispatch this request belongs to, echoed back in the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
}

/// Unvalidated `POST /execute` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequestBody {
    pub task_id: Option<String>,
    pub repo_url: Option<String>,
    pub base_branch: Option<String>,
    pub branch_name: Option<String>,
    pub prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub callback_url: Option<String>,
    pub progress_log: Option<String>,
    pub dispatch_id: Option<String>,
}

impl ExecutionRequestBody {
    /// Validate required fields and apply defaults.
    ///
    /// Values that end up on a git command line must not look like options, and
    /// the branch name is sanitized the same way enqueue does it. Returns the
    /// names of all missing, blank or unusable fields on failure.
    pub fn validate(self, default_max_iterations: u32) -> Result<ExecutionRequest, Vec<String>> {
        let mut invalid = Vec::new();
        let task_id = required(self.task_id, "taskId", &mut invalid);
        let repo_url = required(self.repo_url, "repoUrl", &mut invalid);
        let branch_name = required(self.branch_name, "branchName", &mut invalid);
        let prompt = required(self.prompt, "prompt", &mut invalid);
        let callback_url = required(self.callback_url, "callbackUrl", &mut invalid);
        let base_branch = self
            .base_branch
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string());

        if repo_url.starts_with('-') {
            invalid.push("repoUrl".to_string());
        }
        if base_branch.starts_with('-') || sanitize_branch(&base_branch) != base_branch {
            invalid.push("baseBranch".to_string());
        }
        let branch_name = sanitize_branch(&branch_name);
        if branch_name.is_empty() && !invalid.iter().any(|f| f == "branchName") {
            invalid.push("branchName".to_string());
        }
        if !invalid.is_empty() {
            return Err(invalid);
        }

        let max_iterations = self
            .max_iterations
            .filter(|n| *n > 0)
            .unwrap_or(default_max_iterations);

        Ok(ExecutionRequest {
            task_id,
            repo_url,
            base_branch,
            branch_name,
            prompt,
            max_iterations,
            callback_url,
            progress_log: self.progress_log.unwrap_or_default(),
            dispatch_id: self.dispatch_id.filter(|d| !d.trim().is_empty()),
        })
    }
}

fn required(value: Option<String>, name: &str, missing: &mut Vec<String>) -> String {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => v,
        None => {
            missing.push(name.to_string());
            String::new()
        }
    }
}

/// Outcome of one execution, delivered to the request's callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub tests_pass: bool,
    #[serde(default)]
    pub typecheck_pass: bool,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Copied from the request so the store can discard superseded outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
}

/// Immediate response to `POST /execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedExecution {
    pub execution_id: String,
    pub message: String,
    pub task_id: String,
}

/// Lifecycle of one execution inside the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// In-memory record of one execution. Lost when the agent process exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worktree_path: Option<PathBuf>,
    /// Most recent log lines; older lines are dropped once the byte limit is hit.
    pub logs: VecDeque<String>,
    pub learnings: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionState {
    pub fn pending(id: String, task_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            status: ExecutionStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            worktree_path: None,
            logs: VecDeque::new(),
            learnings: Vec::new(),
            error: None,
        }
    }
}

/// A backlog task after boundary validation. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub branch_name: String,
    pub priority: Option<i64>,
    pub tags: Vec<String>,
}

/// Unvalidated backlog payload (`POST /enqueue`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecordBody {
    pub id: Option<serde_json::Value>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub branch_name: Option<String>,
    pub priority: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskRecordBody {
    /// Normalize a backlog payload into a [`TaskRecord`].
    ///
    /// Numeric ids are accepted and stringified. The description falls back to the
    /// title, and the branch defaults to `task/<id>`.
    pub fn normalize(self) -> Result<TaskRecord, Vec<String>> {
        let mut problems = Vec::new();
        let id = match self.id {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                problems.push("id".to_string());
                String::new()
            }
        };
        let title = self.title.map(|t| t.trim().to_string()).unwrap_or_default();
        let description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| title.clone());
        if description.is_empty() {
            problems.push("description".to_string());
        }
        if !problems.is_empty() {
            return Err(problems);
        }

        let branch_name = self
            .branch_name
            .map(|b| sanitize_branch(&b))
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| sanitize_branch(&format!("task/{id}")));
        let title = if title.is_empty() {
            first_line(&description).to_string()
        } else {
            title
        };

        Ok(TaskRecord {
            id,
            title,
            description,
            branch_name,
            priority: self.priority,
            tags: self.tags,
        })
    }
}

/// Replace characters git refuses in branch names and trim stray separators.
pub fn sanitize_branch(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut out = mapped.replace("..", "-");
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out.trim_matches(|c| c == '/' || c == '-' || c == '.')
        .to_string()
}

pub fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}
