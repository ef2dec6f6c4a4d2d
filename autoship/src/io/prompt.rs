//! Prompt file rendering for the coding agent.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::learnings::COMPLETION_MARKER;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Inputs for one task prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub description: &'a str,
    pub branch: &'a str,
    /// Entire progress log; only the tail is rendered.
    pub progress_log: &'a str,
    pub progress_tail_chars: usize,
}

/// Render the task prompt: description, fixed requirements, progress tail.
pub fn render_task_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("task", TASK_TEMPLATE)
        .context("load task template")?;
    let progress = progress_tail(input.progress_log, input.progress_tail_chars);
    let rendered = env.get_template("task")?.render(context! {
        description => input.description.trim(),
        branch => input.branch,
        marker => COMPLETION_MARKER,
        progress => (!progress.trim().is_empty()).then(|| progress.trim()),
    })?;
    Ok(rendered)
}

/// Last `max_chars` characters of the progress log.
pub fn progress_tail(log: &str, max_chars: usize) -> &str {
    let count = log.chars().count();
    if count <= max_chars {
        return log;
    }
    let skip = count - max_chars;
    match log.char_indices().nth(skip) {
        Some((idx, _)) => &log[idx..],
        None => "",
    }
}

/// Write the rendered prompt to `<dir>/<execution_id>.md`.
pub fn write_prompt_file(dir: &Path, execution_id: &str, prompt: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create prompt dir {}", dir.display()))?;
    let path = dir.join(format!("{execution_id}.md"));
    fs::write(&path, prompt).with_context(|| format!("write prompt {}", path.display()))?;
    debug!(path = %path.display(), bytes = prompt.len(), "prompt written");
    Ok(path)
}
