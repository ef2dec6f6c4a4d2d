//! Git adapter for the execution pipeline.
//!
//! The pipeline clones, branches, commits and force-pushes on behalf of the
//! coding agent, so we keep a small, explicit wrapper around `git` subprocess
//! calls rather than a library binding.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Author identity used for agent commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` into `dest` (the parent directory must exist).
    #[instrument(skip_all, fields(url, dest = %dest.display()))]
    pub fn clone_repo(url: &str, dest: &Path) -> Result<Git> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("clone destination has no parent: {}", dest.display()))?;
        let dest_arg = dest.to_string_lossy().to_string();
        Git::new(parent).run_checked(&["clone", "--no-tags", "--", url, &dest_arg])?;
        debug!("clone finished");
        Ok(Git::new(dest))
    }

    /// Fetch `refspec` from `origin` (all branches when `None`), pruning deleted refs.
    pub fn fetch_origin(&self, refspec: Option<&str>) -> Result<()> {
        match refspec {
            Some(r) => self.run_checked(&["fetch", "--prune", "--", "origin", r])?,
            None => self.run_checked(&["fetch", "--prune", "origin"])?,
        };
        Ok(())
    }

    /// Resolve a revision to its full SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    /// Add a worktree at `path` on `branch`, resetting the branch to `start_point`.
    #[instrument(skip_all, fields(path = %path.display(), branch, start_point))]
    pub fn worktree_add(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        let path_arg = path.to_string_lossy().to_string();
        if branch.starts_with('-') {
            return Err(anyhow!("refusing option-like branch name '{branch}'"));
        }
        self.run_checked(&["worktree", "add", "-B", branch, "--", &path_arg, start_point])?;
        Ok(())
    }

    /// Force-remove the worktree registered at `path`.
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy().to_string();
        self.run_checked(&["worktree", "remove", "--force", "--", &path_arg])?;
        Ok(())
    }

    /// Drop administrative entries for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes as `author` (also used as committer).
    #[instrument(skip_all, fields(author = %author.name))]
    pub fn commit_as(&self, message: &str, author: &Identity) -> Result<()> {
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        let author_arg = format!("{} <{}>", author.name, author.email);
        self.run_checked(&[
            "-c",
            &name,
            "-c",
            &email,
            "commit",
            "--no-verify",
            "--author",
            &author_arg,
            "-m",
            message,
        ])?;
        Ok(())
    }

    /// Force-push `branch` to origin and set it as upstream.
    #[instrument(skip_all, fields(branch))]
    pub fn push_force_upstream(&self, branch: &str) -> Result<()> {
        self.run_checked(&["push", "--force", "--set-upstream", "--", "origin", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Porcelain quotes paths containing spaces or special characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
