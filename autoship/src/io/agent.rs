//! Coding-agent runner.
//!
//! The [`AgentBackend`] trait decouples the pipeline from the actual agent CLI.
//! Tests use scripted backends that edit the worktree and print a canned
//! transcript without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::learnings::{extract_learnings, is_complete};
use crate::io::config::AgentCommandConfig;
use crate::io::process::{LineSink, run_command_with_stream};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub workdir: PathBuf,
    pub prompt_path: PathBuf,
    pub prompt: String,
    /// 1-indexed iteration number.
    pub iteration: u32,
    /// Remaining share of the run's wall-clock budget.
    pub timeout: Duration,
}

/// Abstraction over coding-agent backends.
pub trait AgentBackend: Send + Sync {
    /// Run the agent once and return its transcript.
    ///
    /// Every output line is also forwarded to `sink`. A timeout is an error.
    fn invoke(&self, invocation: &AgentInvocation, sink: LineSink) -> Result<String>;
}

/// Agent backend that spawns the configured CLI with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgentBackend {
    config: AgentCommandConfig,
}

impl CommandAgentBackend {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }

    fn command(&self, workdir: &Path) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if !self.config.allowed_tools.is_empty() {
            cmd.arg(&self.config.allowed_tools_flag)
                .arg(self.config.allowed_tools.join(","));
        }
        cmd.current_dir(workdir);
        Ok(cmd)
    }
}

impl AgentBackend for CommandAgentBackend {
    #[instrument(skip_all, fields(iteration = invocation.iteration, timeout_secs = invocation.timeout.as_secs()))]
    fn invoke(&self, invocation: &AgentInvocation, sink: LineSink) -> Result<String> {
        let cmd = self.command(&invocation.workdir)?;
        let output = run_command_with_stream(
            cmd,
            Some(invocation.prompt.as_bytes()),
            invocation.timeout,
            self.config.output_limit_bytes,
            sink,
        )
        .context("run coding agent")?;

        if output.timed_out {
            return Err(anyhow!(
                "coding agent timed out after {}s",
                invocation.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "coding agent exited unsuccessfully");
        }
        Ok(output.combined("agent"))
    }
}

/// Result of a bounded agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    /// The completion marker was seen.
    pub completed: bool,
    pub iterations: u32,
    pub transcript: String,
    pub learnings: Vec<String>,
}

/// Run the agent against a prompt file until it reports completion.
///
/// At most `max_iterations` invocations share one wall-clock budget of
/// `timeout`. Running out of budget is an error; running out of iterations
/// without the completion marker is not.
#[instrument(skip_all, fields(workdir = %workdir.display(), max_iterations))]
pub fn run_agent(
    backend: &dyn AgentBackend,
    workdir: &Path,
    prompt_path: &Path,
    max_iterations: u32,
    timeout: Duration,
    sink: LineSink,
) -> Result<AgentRun> {
    let prompt = fs::read_to_string(prompt_path)
        .with_context(|| format!("read prompt {}", prompt_path.display()))?;
    let deadline = Instant::now() + timeout;
    let mut transcript = String::new();
    let mut iterations = 0;
    let mut completed = false;

    while iterations < max_iterations.max(1) {
        let budget = remaining_budget(deadline).map_err(|_| {
            anyhow!("coding agent timed out after {}s", timeout.as_secs())
        })?;
        iterations += 1;
        let invocation = AgentInvocation {
            workdir: workdir.to_path_buf(),
            prompt_path: prompt_path.to_path_buf(),
            prompt: prompt.clone(),
            iteration: iterations,
            timeout: budget,
        };
        let output = backend.invoke(&invocation, sink.clone())?;
        if !transcript.is_empty() && !transcript.ends_with('\n') {
            transcript.push('\n');
        }
        transcript.push_str(&output);
        if is_complete(&output) {
            completed = true;
            break;
        }
        info!(iteration = iterations, "agent did not report completion");
    }

    Ok(AgentRun {
        completed,
        iterations,
        learnings: extract_learnings(&transcript),
        transcript,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    use crate::core::learnings::COMPLETION_MARKER;

    struct Canned {
        outputs: Mutex<Vec<Result<String>>>,
        seen: Mutex<Vec<AgentInvocation>>,
    }

    impl Canned {
        fn new(outputs: Vec<Result<String>>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl AgentBackend for Canned {
        fn invoke(&self, invocation: &AgentInvocation, sink: LineSink) -> Result<String> {
            self.seen.lock().expect("lock").push(invocation.clone());
            let next = self.outputs.lock().expect("lock").remove(0)?;
            for line in next.lines() {
                sink(line);
            }
            Ok(next)
        }
    }

    fn noop_sink() -> LineSink {
        Arc::new(|_: &str| {})
    }

    fn prompt_file(dir: &Path) -> PathBuf {
        let path = dir.join("prompt.md");
        fs::write(&path, "do the thing").expect("write prompt");
        path
    }

    #[test]
    fn stops_at_completion_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Canned::new(vec![
            Ok("working\nnote: the build uses vite under the hood".to_string()),
            Ok(format!("done\n{COMPLETION_MARKER}")),
            Ok("never reached".to_string()),
        ]);
        let run = run_agent(
            &backend,
            temp.path(),
            &prompt_file(temp.path()),
            5,
            Duration::from_secs(60),
            noop_sink(),
        )
        .expect("run");

        assert!(run.completed);
        assert_eq!(run.iterations, 2);
        assert_eq!(run.learnings, vec!["the build uses vite under the hood"]);
        let seen = backend.seen.lock().expect("lock");
        assert_eq!(seen[0].prompt, "do the thing");
        assert_eq!(seen[1].iteration, 2);
    }

    #[test]
    fn missing_marker_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Canned::new(vec![Ok("one".to_string()), Ok("two".to_string())]);
        let run = run_agent(
            &backend,
            temp.path(),
            &prompt_file(temp.path()),
            2,
            Duration::from_secs(60),
            noop_sink(),
        )
        .expect("run");
        assert!(!run.completed);
        assert_eq!(run.iterations, 2);
        assert_eq!(run.transcript, "one\ntwo");
    }

    #[test]
    fn backend_timeout_propagates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Canned::new(vec![Err(anyhow!("coding agent timed out after 1s"))]);
        let err = run_agent(
            &backend,
            temp.path(),
            &prompt_file(temp.path()),
            3,
            Duration::from_secs(60),
            noop_sink(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn command_backend_pipes_prompt_and_kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = CommandAgentBackend::new(AgentCommandConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "cat; echo".to_string()],
            allowed_tools: Vec::new(),
            ..AgentCommandConfig::default()
        });
        let invocation = AgentInvocation {
            workdir: temp.path().to_path_buf(),
            prompt_path: temp.path().join("unused.md"),
            prompt: COMPLETION_MARKER.to_string(),
            iteration: 1,
            timeout: Duration::from_secs(10),
        };
        let transcript = backend.invoke(&invocation, noop_sink()).expect("invoke");
        assert!(is_complete(&transcript));

        let slow = CommandAgentBackend::new(AgentCommandConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exec sleep 5".to_string()],
            allowed_tools: Vec::new(),
            ..AgentCommandConfig::default()
        });
        let err = slow
            .invoke(
                &AgentInvocation {
                    timeout: Duration::from_millis(200),
                    ..invocation
                },
                noop_sink(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
