//! Execution Agent: turns one task into a verified, committed, pushed change.
//!
//! Each accepted request runs in its own background task. The pipeline itself
//! is blocking (git, package manager, coding agent) and runs on the blocking
//! pool; the outcome is always delivered to the request's callback URL, never
//! returned to the caller that submitted it.
//!
//! Pipeline steps, each failure short-circuiting the rest:
//!
//! 1. reap expired worktrees, then clone or fetch the base repository
//! 2. create a fresh worktree for the task branch from `origin/<base>`
//! 3. install dependencies
//! 4. render the prompt file
//! 5. run the coding agent
//! 6. run the quality gate (the worktree is kept when it fails)
//! 7. require a non-empty diff
//! 8. commit as the configured author
//! 9. force-push with upstream tracking
//! 10. deliver the result and remove the worktree

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::commit_message;
use crate::core::types::{
    AcceptedExecution, ExecutionRequest, ExecutionResult, ExecutionState, ExecutionStatus,
};
use crate::io::agent::{AgentBackend, run_agent};
use crate::io::config::AgentConfig;
use crate::io::git::Identity;
use crate::io::http::post_json_with_retry;
use crate::io::process::LineSink;
use crate::io::prompt::{PromptInputs, render_task_prompt, write_prompt_file};
use crate::io::quality::{InstallOutcome, QualityGate};
use crate::io::worktree::{Worktree, WorktreeManager};

pub const CANCELLED_ERROR: &str = "execution cancelled";
pub const NO_CHANGES_ERROR: &str = "no changes were made";

#[derive(Debug)]
struct Tracked {
    state: ExecutionState,
    worktree: Option<Worktree>,
    log_bytes: usize,
}

/// In-memory execution states, lost when the process exits.
///
/// Each execution keeps only the tail of its log. Finished executions are
/// evicted once they are older than the retention window.
#[derive(Debug)]
pub struct ExecutionRegistry {
    inner: Mutex<HashMap<String, Tracked>>,
    log_limit_bytes: usize,
    retention: Duration,
}

impl ExecutionRegistry {
    pub fn new(log_limit_bytes: usize, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            log_limit_bytes,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new execution, evicting finished ones past retention.
    pub fn insert(&self, state: ExecutionState) {
        let mut inner = self.lock();
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        inner.retain(|_, t| {
            !t.state.status.is_terminal()
                || t.state
                    .finished_at
                    .is_none_or(|finished| now.signed_duration_since(finished) < retention)
        });
        inner.insert(
            state.id.clone(),
            Tracked {
                state,
                worktree: None,
                log_bytes: 0,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ExecutionState> {
        self.lock().get(id).map(|t| t.state.clone())
    }

    /// Executions that have not reached a terminal status.
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|t| !t.state.status.is_terminal())
            .count()
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|t| t.state.status == ExecutionStatus::Cancelled)
    }

    /// Append a line, dropping the oldest lines beyond the byte limit.
    pub fn append_log(&self, id: &str, line: &str) {
        let limit = self.log_limit_bytes;
        if let Some(tracked) = self.lock().get_mut(id) {
            let line = tail_bytes(line, limit);
            tracked.log_bytes += line.len() + 1;
            tracked.state.logs.push_back(line.to_string());
            while tracked.log_bytes > limit + 1
                && let Some(dropped) = tracked.state.logs.pop_front()
            {
                tracked.log_bytes -= dropped.len() + 1;
            }
        }
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Tracked)) {
        if let Some(tracked) = self.lock().get_mut(id) {
            f(tracked);
        }
    }

    /// Mark cancelled unless already terminal; returns the snapshot and the
    /// worktree to remove.
    fn cancel(&self, id: &str) -> Option<(ExecutionState, Option<Worktree>)> {
        let mut inner = self.lock();
        let tracked = inner.get_mut(id)?;
        if tracked.state.status.is_terminal() {
            return Some((tracked.state.clone(), None));
        }
        tracked.state.status = ExecutionStatus::Cancelled;
        tracked.state.finished_at = Some(Utc::now());
        tracked.state.error = Some(CANCELLED_ERROR.to_string());
        Some((tracked.state.clone(), tracked.worktree.clone()))
    }
}

/// Facts gathered while the pipeline runs, reported even when it fails.
#[derive(Debug, Default)]
struct Findings {
    tests_pass: bool,
    typecheck_pass: bool,
    learnings: Vec<String>,
    files_changed: Vec<String>,
    keep_worktree: bool,
}

/// Runs task pipelines and tracks their in-memory state.
#[derive(Clone)]
pub struct ExecutionAgent {
    config: Arc<AgentConfig>,
    worktrees: Arc<WorktreeManager>,
    backend: Arc<dyn AgentBackend>,
    quality: Arc<dyn QualityGate>,
    registry: Arc<ExecutionRegistry>,
    client: reqwest::Client,
}

impl ExecutionAgent {
    pub fn new(
        config: AgentConfig,
        backend: Arc<dyn AgentBackend>,
        quality: Arc<dyn QualityGate>,
    ) -> Self {
        let worktrees = Arc::new(WorktreeManager::new(config.workspace_root.clone()));
        let registry = Arc::new(ExecutionRegistry::new(
            config.log_limit_bytes,
            Duration::from_secs(config.execution_retention_secs),
        ));
        Self {
            config: Arc::new(config),
            worktrees,
            backend,
            quality,
            registry,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Accept a request and run it in the background.
    pub fn submit(&self, request: ExecutionRequest) -> AcceptedExecution {
        let id = self.register(&request);
        let agent = self.clone();
        let execution_id = id.clone();
        let task_id = request.task_id.clone();
        tokio::spawn(async move {
            agent.execute(&execution_id, request).await;
        });
        AcceptedExecution {
            execution_id: id,
            message: "execution started".to_string(),
            task_id,
        }
    }

    /// Register and run a request to completion (callback included).
    pub async fn run(&self, request: ExecutionRequest) -> (String, ExecutionResult) {
        let id = self.register(&request);
        let result = self.execute(&id, request).await;
        (id, result)
    }

    fn register(&self, request: &ExecutionRequest) -> String {
        let id = Uuid::new_v4().to_string();
        self.registry.insert(ExecutionState::pending(
            id.clone(),
            request.task_id.clone(),
            Utc::now(),
        ));
        id
    }

    pub fn status(&self, id: &str) -> Option<ExecutionState> {
        self.registry.get(id)
    }

    /// Best-effort cancel: flags the execution and removes its worktree.
    ///
    /// A running agent process is not interrupted; the pipeline stops at the
    /// next step boundary.
    pub async fn cancel(&self, id: &str) -> Option<ExecutionState> {
        let (state, worktree) = self.registry.cancel(id)?;
        if let Some(worktree) = worktree {
            let worktrees = self.worktrees.clone();
            let removed =
                tokio::task::spawn_blocking(move || worktrees.delete_worktree(&worktree)).await;
            if let Err(err) = removed {
                warn!(execution_id = id, err = %err, "worktree cleanup task failed");
            }
        }
        info!(execution_id = id, "execution cancelled");
        Some(state)
    }

    /// Run the pipeline, record the final state and deliver the callback.
    ///
    /// Never fails: every error becomes a failed result.
    #[instrument(skip_all, fields(execution_id = id, task_id = %request.task_id))]
    pub async fn execute(&self, id: &str, request: ExecutionRequest) -> ExecutionResult {
        self.registry.update(id, |t| {
            if t.state.status == ExecutionStatus::Pending {
                t.state.status = ExecutionStatus::Running;
            }
            t.state.started_at = Some(Utc::now());
        });

        let agent = self.clone();
        let pipeline_id = id.to_string();
        let pipeline_request = request.clone();
        let started = Instant::now();
        let result = match tokio::task::spawn_blocking(move || {
            agent.run_pipeline(&pipeline_id, &pipeline_request)
        })
        .await
        {
            Ok(result) => result,
            Err(err) => self.failure_result(
                id,
                &request,
                &Findings::default(),
                anyhow!("pipeline task failed: {err}"),
                started.elapsed(),
            ),
        };

        self.registry.update(id, |t| {
            if t.state.status != ExecutionStatus::Cancelled {
                t.state.status = if result.success {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                t.state.error = result.error.clone();
            }
            t.state.learnings = result.learnings.clone();
            t.state.finished_at = Some(Utc::now());
        });

        self.deliver(&request.callback_url, &result).await;
        result
    }

    async fn deliver(&self, callback_url: &str, result: &ExecutionResult) {
        match post_json_with_retry(
            &self.client,
            callback_url,
            None,
            result,
            &self.config.callback_retry,
        )
        .await
        {
            Ok(()) => info!(callback_url, success = result.success, "result delivered"),
            Err(err) => warn!(callback_url, err = %format!("{err:#}"), "callback delivery failed, dropping result"),
        }
    }

    /// Blocking pipeline body. Cleans up after itself on every path except a
    /// quality-gate failure.
    fn run_pipeline(&self, id: &str, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let mut findings = Findings::default();
        let mut worktree = None;
        let mut prompt_path = None;

        let outcome = self.pipeline_steps(
            id,
            request,
            &mut findings,
            &mut worktree,
            &mut prompt_path,
        );

        if let Some(path) = prompt_path
            && let Err(err) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), err = %err, "failed to remove prompt file");
        }
        if let Some(wt) = &worktree {
            if findings.keep_worktree {
                self.log(id, &format!("keeping worktree {} for inspection", wt.path.display()));
            } else if !self.worktrees.delete_worktree(wt) {
                self.log(id, &format!("worktree {} could not be removed", wt.path.display()));
            }
        }

        match outcome {
            Ok(()) => {
                self.log(id, "execution succeeded");
                ExecutionResult {
                    task_id: request.task_id.clone(),
                    success: true,
                    pr_url: None,
                    error: None,
                    logs: self.log_tail(id),
                    learnings: findings.learnings,
                    tests_pass: findings.tests_pass,
                    typecheck_pass: findings.typecheck_pass,
                    duration: millis(started.elapsed()),
                    files_changed: findings.files_changed,
                    dispatch_id: request.dispatch_id.clone(),
                }
            }
            Err(err) => self.failure_result(id, request, &findings, err, started.elapsed()),
        }
    }

    fn pipeline_steps(
        &self,
        id: &str,
        request: &ExecutionRequest,
        findings: &mut Findings,
        worktree_slot: &mut Option<Worktree>,
        prompt_slot: &mut Option<PathBuf>,
    ) -> Result<()> {
        let reaped = self
            .worktrees
            .reap_stale(Duration::from_secs(self.config.worktree_retention_secs));
        if !reaped.is_empty() {
            self.log(id, &format!("reaped {} expired worktree(s)", reaped.len()));
        }

        self.check_cancelled(id)?;
        self.log(id, &format!("preparing worktree for {}", request.branch_name));
        let worktree = self.worktrees.create_worktree(
            &request.repo_url,
            &request.branch_name,
            &request.base_branch,
        )?;
        self.registry.update(id, |t| {
            t.state.worktree_path = Some(worktree.path.clone());
            t.worktree = Some(worktree.clone());
        });
        *worktree_slot = Some(worktree.clone());

        self.check_cancelled(id)?;
        match self.quality.install(&worktree.path)? {
            InstallOutcome::Installed => self.log(id, "dependencies installed"),
            InstallOutcome::AlreadyPresent => self.log(id, "dependencies already present"),
            InstallOutcome::NoManifest => self.log(id, "no manifest, skipping install"),
        }

        let prompt = render_task_prompt(&PromptInputs {
            description: &request.prompt,
            branch: &request.branch_name,
            progress_log: &request.progress_log,
            progress_tail_chars: self.config.progress_tail_chars,
        })?;
        let prompt_path =
            write_prompt_file(&self.worktrees.root().join("prompts"), id, &prompt)?;
        *prompt_slot = Some(prompt_path.clone());

        self.check_cancelled(id)?;
        self.log(
            id,
            &format!("running agent (max {} iterations)", request.max_iterations),
        );
        let run = run_agent(
            self.backend.as_ref(),
            &worktree.path,
            &prompt_path,
            request.max_iterations,
            Duration::from_secs(self.config.agent.timeout_secs),
            self.log_sink(id),
        )?;
        findings.learnings = run.learnings;
        if run.completed {
            self.log(id, &format!("agent reported completion after {} iteration(s)", run.iterations));
        } else {
            self.log(id, "agent did not report completion, continuing");
        }

        self.check_cancelled(id)?;
        let report = self.quality.run_all(&worktree.path);
        findings.typecheck_pass = report.typecheck;
        findings.tests_pass = report.tests;
        if !report.passed() {
            findings.keep_worktree = true;
            bail!("quality gate failed: {}", report.errors.join("\n"));
        }
        self.log(id, "quality gate passed");

        let changed = worktree.changed_files()?;
        if changed.is_empty() {
            bail!(NO_CHANGES_ERROR);
        }
        findings.files_changed = changed.clone();

        self.check_cancelled(id)?;
        let message = commit_message::render(
            &request.prompt,
            &changed,
            self.config.co_author.as_deref(),
        );
        let author = Identity::from(&self.config.commit_author);
        worktree.commit(&message, &author)?;
        self.log(id, &format!("committed {} file(s)", changed.len()));

        worktree.push()?;
        self.log(id, &format!("pushed {}", worktree.branch));
        Ok(())
    }

    fn check_cancelled(&self, id: &str) -> Result<()> {
        if self.registry.is_cancelled(id) {
            return Err(anyhow!(CANCELLED_ERROR));
        }
        Ok(())
    }

    fn failure_result(
        &self,
        id: &str,
        request: &ExecutionRequest,
        findings: &Findings,
        err: anyhow::Error,
        elapsed: Duration,
    ) -> ExecutionResult {
        let error = if self.registry.is_cancelled(id) {
            CANCELLED_ERROR.to_string()
        } else {
            format!("{err:#}")
        };
        self.log(id, &format!("execution failed: {error}"));
        ExecutionResult {
            task_id: request.task_id.clone(),
            success: false,
            pr_url: None,
            error: Some(error),
            logs: self.log_tail(id),
            learnings: findings.learnings.clone(),
            tests_pass: findings.tests_pass,
            typecheck_pass: findings.typecheck_pass,
            duration: millis(elapsed),
            files_changed: findings.files_changed.clone(),
            dispatch_id: request.dispatch_id.clone(),
        }
    }

    fn log(&self, id: &str, line: &str) {
        info!(execution_id = id, "{line}");
        self.registry.append_log(id, line);
    }

    fn log_sink(&self, id: &str) -> LineSink {
        let registry = self.registry.clone();
        let id = id.to_string();
        Arc::new(move |line: &str| registry.append_log(&id, line))
    }

    fn log_tail(&self, id: &str) -> String {
        let logs = self
            .registry
            .get(id)
            .map(|s| Vec::from(s.logs).join("\n"))
            .unwrap_or_default();
        tail_bytes(&logs, self.config.log_limit_bytes).to_string()
    }
}

/// Last `max_bytes` of `text`, moved forward to a char boundary.
fn tail_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
