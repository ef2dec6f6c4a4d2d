//! Test-only helpers: deterministic records, a local git origin, and scripted
//! stand-ins for the coding agent, the quality gate and the dispatcher.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use crate::core::learnings::COMPLETION_MARKER;
use crate::core::ledger::Ledger;
use crate::core::types::{ExecutionRequest, TaskRecord};
use crate::io::agent::{AgentBackend, AgentInvocation};
use crate::io::config::AgentConfig;
use crate::io::http::RetryPolicy;
use crate::io::process::LineSink;
use crate::io::quality::{InstallOutcome, QualityGate, QualityReport};
use crate::store::Dispatcher;

/// Create a deterministic task on branch `task/<id>`.
pub fn task(id: &str) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        branch_name: format!("task/{id}"),
        priority: None,
        tags: Vec::new(),
    }
}

/// A ledger holding fresh entries for `ids`.
pub fn ledger_with(ids: &[&str]) -> Ledger {
    let now = Utc::now();
    let mut ledger = Ledger::empty("test", now);
    for id in ids {
        ledger.enqueue(&task(id), now);
    }
    ledger
}

/// Agent config rooted at `workspace`, with fast, single-shot callbacks.
pub fn agent_config(workspace: &Path) -> AgentConfig {
    AgentConfig {
        workspace_root: workspace.to_path_buf(),
        callback_retry: RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            request_timeout_secs: 2,
            ..RetryPolicy::default()
        },
        ..AgentConfig::default()
    }
}

/// A bare repository standing in for the remote, seeded with one commit on `main`.
pub struct TestOrigin {
    _dir: TempDir,
    bare: PathBuf,
    url: String,
}

impl TestOrigin {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("origin tempdir")?;
        let seed = dir.path().join("seed");
        let bare = dir.path().join("origin.git");
        fs::create_dir_all(&seed).context("create seed")?;

        git(&seed, &["init", "--quiet"])?;
        git(&seed, &["checkout", "--quiet", "-b", "main"])?;
        fs::write(
            seed.join("package.json"),
            "{\n  \"name\": \"fixture\",\n  \"version\": \"1.0.0\",\n  \"scripts\": {}\n}\n",
        )
        .context("write package.json")?;
        fs::write(seed.join(".gitignore"), "node_modules/\n").context("write .gitignore")?;
        git(&seed, &["add", "-A"])?;
        git(
            &seed,
            &[
                "-c",
                "user.name=seed",
                "-c",
                "user.email=seed@example.invalid",
                "commit",
                "--quiet",
                "-m",
                "Initial commit",
            ],
        )?;
        git(
            dir.path(),
            &["clone", "--quiet", "--bare", "seed", "origin.git"],
        )?;

        let url = bare.to_string_lossy().to_string();
        Ok(Self {
            _dir: dir,
            bare,
            url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Commit SHA of `branch` on the origin.
    pub fn head(&self, branch: &str) -> Result<String> {
        let out = git(&self.bare, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?;
        Ok(out.trim().to_string())
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.head(branch).is_ok()
    }

    /// `name <email>` of the tip commit's author on `branch`.
    pub fn author_of(&self, branch: &str) -> Result<String> {
        let out = git(
            &self.bare,
            &["log", "-1", "--format=%an <%ae>", &format!("refs/heads/{branch}")],
        )?;
        Ok(out.trim().to_string())
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Write an executable `fake-pm` shell script into `dir` and return its path.
///
/// The script receives the same arguments as the real package manager, e.g.
/// `run test`.
pub fn write_fake_package_manager(dir: &Path, script_body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-pm");
    fs::write(&path, format!("#!/bin/sh\n{script_body}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms)?;
    Ok(path)
}

/// Coding agent that edits files in the worktree and prints a canned transcript.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    writes: Vec<(String, String)>,
    lines: Vec<String>,
    complete: bool,
    error: Option<String>,
    calls: AtomicU32,
}

impl ScriptedAgent {
    /// Prints the completion marker and changes nothing until told to.
    pub fn completing() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }

    /// Never prints the completion marker.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Fails every invocation with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn writing(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn saying(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentBackend for ScriptedAgent {
    fn invoke(&self, invocation: &AgentInvocation, sink: LineSink) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.error {
            return Err(anyhow!("{message}"));
        }
        for (rel, contents) in &self.writes {
            let path = invocation.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        let mut transcript = self.lines.clone();
        if self.complete {
            transcript.push(COMPLETION_MARKER.to_string());
        }
        for line in &transcript {
            sink(line);
        }
        Ok(transcript.join("\n"))
    }
}

/// Quality gate returning a fixed verdict.
#[derive(Debug)]
pub struct ScriptedQualityGate {
    report: QualityReport,
    runs: AtomicU32,
}

impl ScriptedQualityGate {
    pub fn passing() -> Self {
        Self::with_report(QualityReport {
            typecheck: true,
            tests: true,
            lint: true,
            errors: Vec::new(),
        })
    }

    pub fn failing_tests(reason: &str) -> Self {
        Self::with_report(QualityReport {
            typecheck: true,
            tests: false,
            lint: true,
            errors: vec![format!("tests failed:\n{reason}")],
        })
    }

    pub fn with_report(report: QualityReport) -> Self {
        Self {
            report,
            runs: AtomicU32::new(0),
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

impl QualityGate for ScriptedQualityGate {
    fn install(&self, _workdir: &Path) -> Result<InstallOutcome> {
        Ok(InstallOutcome::AlreadyPresent)
    }

    fn run_all(&self, _workdir: &Path) -> QualityReport {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.report.clone()
    }
}

/// Dispatcher that records requests instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl RecordingDispatcher {
    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Poll until at least `count` requests arrived or `timeout` passed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<ExecutionRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.requests();
            if seen.len() >= count || Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: ExecutionRequest) -> Result<()> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
        Ok(())
    }
}

/// Dispatcher whose agent can never be reached.
#[derive(Debug, Default)]
pub struct UnreachableDispatcher;

#[async_trait]
impl Dispatcher for UnreachableDispatcher {
    async fn dispatch(&self, request: ExecutionRequest) -> Result<()> {
        Err(anyhow!("connection refused for {}", request.task_id))
    }
}
