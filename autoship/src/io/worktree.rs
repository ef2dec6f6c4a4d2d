//! Branch-scoped worktrees over shared repository clones.
//!
//! Layout under the workspace root:
//!
//! ```text
//! repos/<slug>/                 shared clone (one per repository URL)
//! worktrees/<slug>/<branch>/    one isolated checkout per task branch
//! ```
//!
//! Clone/fetch and worktree creation/deletion mutate the shared clone's
//! administrative files, so they run under a per-repository lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::io::git::{Git, Identity};

/// Creates and destroys worktrees for any number of repositories.
#[derive(Debug)]
pub struct WorktreeManager {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// One task's isolated checkout.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub repo_dir: PathBuf,
    pub path: PathBuf,
    pub branch: String,
}

impl WorktreeManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, repo_url: &str) -> PathBuf {
        self.root.join("repos").join(repo_slug(repo_url))
    }

    pub fn worktree_path(&self, repo_url: &str, branch: &str) -> PathBuf {
        self.root
            .join("worktrees")
            .join(repo_slug(repo_url))
            .join(branch_slug(branch))
    }

    /// Clone the repository if absent, otherwise fetch.
    #[instrument(skip_all, fields(repo_url))]
    pub fn ensure_repo(&self, repo_url: &str) -> Result<PathBuf> {
        let slug = repo_slug(repo_url);
        let lock = self.lock_for(&slug);
        let _guard = acquire(&lock);
        self.ensure_repo_locked(repo_url)
    }

    fn ensure_repo_locked(&self, repo_url: &str) -> Result<PathBuf> {
        let repo_dir = self.repo_dir(repo_url);
        if repo_dir.join(".git").exists() {
            debug!(repo_dir = %repo_dir.display(), "fetching existing clone");
            Git::new(&repo_dir)
                .fetch_origin(None)
                .with_context(|| format!("fetch {repo_url}"))?;
        } else {
            if repo_dir.exists() {
                // Leftover from an interrupted clone.
                fs::remove_dir_all(&repo_dir)
                    .with_context(|| format!("remove partial clone {}", repo_dir.display()))?;
            }
            let parent = repo_dir
                .parent()
                .ok_or_else(|| anyhow!("repo dir has no parent"))?;
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
            info!(repo_dir = %repo_dir.display(), "cloning repository");
            Git::clone_repo(repo_url, &repo_dir).with_context(|| format!("clone {repo_url}"))?;
        }
        Ok(repo_dir)
    }

    /// Create a fresh worktree for `branch` from `origin/<base>`.
    ///
    /// Idempotent: any stale worktree at the target path is force-removed first,
    /// and the local branch is reset to the fetched base tip.
    #[instrument(skip_all, fields(repo_url, branch, base))]
    pub fn create_worktree(&self, repo_url: &str, branch: &str, base: &str) -> Result<Worktree> {
        let slug = repo_slug(repo_url);
        let lock = self.lock_for(&slug);
        let _guard = acquire(&lock);

        let repo_dir = self.ensure_repo_locked(repo_url)?;
        let git = Git::new(&repo_dir);
        let path = self.worktree_path(repo_url, branch);

        if let Err(err) = git.worktree_remove(&path) {
            debug!(err = %err, "no stale worktree to remove");
        }
        if path.exists() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale worktree dir {}", path.display()))?;
        }
        git.worktree_prune().context("prune worktrees")?;

        git.fetch_origin(Some(base))
            .with_context(|| format!("fetch base branch {base}"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let start_point = format!("origin/{base}");
        git.worktree_add(&path, branch, &start_point)
            .with_context(|| format!("create worktree for {branch} from {start_point}"))?;

        info!(path = %path.display(), "worktree created");
        Ok(Worktree {
            repo_dir,
            path,
            branch: branch.to_string(),
        })
    }

    /// Remove a worktree. Best-effort: failures are logged, never returned.
    ///
    /// Returns true when the directory is gone afterwards.
    #[instrument(skip_all, fields(path = %worktree.path.display()))]
    pub fn delete_worktree(&self, worktree: &Worktree) -> bool {
        let slug = worktree
            .repo_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let lock = self.lock_for(&slug);
        let _guard = acquire(&lock);
        remove_worktree_dir(&worktree.repo_dir, &worktree.path)
    }

    /// Remove worktrees whose last modification is older than `max_age`.
    ///
    /// Returns the removed paths.
    pub fn reap_stale(&self, max_age: Duration) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        let Ok(repos) = fs::read_dir(self.root.join("worktrees")) else {
            return removed;
        };
        let now = SystemTime::now();
        for repo in repos.flatten() {
            let slug = repo.file_name().to_string_lossy().to_string();
            let repo_dir = self.root.join("repos").join(&slug);
            let Ok(entries) = fs::read_dir(repo.path()) else {
                continue;
            };
            let lock = self.lock_for(&slug);
            let _guard = acquire(&lock);
            for entry in entries.flatten() {
                let path = entry.path();
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok());
                if age.is_some_and(|age| age >= max_age) && remove_worktree_dir(&repo_dir, &path)
                {
                    info!(path = %path.display(), "reaped stale worktree");
                    removed.push(path);
                }
            }
        }
        removed
    }

    fn lock_for(&self, slug: &str) -> Arc<Mutex<()>> {
        let mut locks = acquire(&self.locks);
        locks
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Worktree {
    pub fn git(&self) -> Git {
        Git::new(&self.path)
    }

    /// Paths changed relative to HEAD, including untracked files.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        let entries = self.git().status_porcelain()?;
        Ok(entries.into_iter().map(|e| e.path).collect())
    }

    /// Stage everything and commit as `author`.
    ///
    /// Fails with a "no changes" error when nothing is staged.
    pub fn commit(&self, message: &str, author: &Identity) -> Result<()> {
        let git = self.git();
        git.add_all()?;
        if !git.has_staged_changes()? {
            return Err(anyhow!("no changes to commit on {}", self.branch));
        }
        git.commit_as(message, author)
    }

    /// Force-push the branch with upstream tracking.
    pub fn push(&self) -> Result<()> {
        self.git().push_force_upstream(&self.branch)
    }
}

fn remove_worktree_dir(repo_dir: &Path, path: &Path) -> bool {
    let git = Git::new(repo_dir);
    if repo_dir.exists()
        && let Err(err) = git.worktree_remove(path)
    {
        debug!(err = %err, "git worktree remove failed, removing directory");
    }
    if path.exists()
        && let Err(err) = fs::remove_dir_all(path)
    {
        warn!(err = %err, path = %path.display(), "failed to delete worktree directory");
    }
    if repo_dir.exists()
        && let Err(err) = git.worktree_prune()
    {
        warn!(err = %err, "failed to prune worktrees");
    }
    !path.exists()
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stable directory name for a repository URL: `<name>-<sha256 prefix>`.
pub fn repo_slug(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/');
    let name = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let name = if name.is_empty() { "repo".to_string() } else { name };
    let digest = Sha256::digest(repo_url.as_bytes());
    format!("{name}-{}", &hex::encode(digest)[..8])
}

/// Flatten a branch name into a single path component.
pub fn branch_slug(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestOrigin;

    fn bot() -> Identity {
        Identity {
            name: "autoship-bot".to_string(),
            email: "bot@autoship.invalid".to_string(),
        }
    }

    #[test]
    fn slugs_are_stable_and_path_safe() {
        let a = repo_slug("https://github.com/acme/web-app.git");
        assert!(a.starts_with("web-app-"));
        assert_eq!(a, repo_slug("https://github.com/acme/web-app.git"));
        assert_ne!(a, repo_slug("https://github.com/other/web-app.git"));
        assert_eq!(branch_slug("task/a b"), "task-a-b");
    }

    #[test]
    fn create_worktree_twice_tracks_origin_tip() {
        let origin = TestOrigin::new().expect("origin");
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(temp.path());

        let first = manager
            .create_worktree(origin.url(), "task/a", "main")
            .expect("first create");
        std::fs::write(first.path.join("scratch.txt"), "dirty").expect("dirty worktree");

        let second = manager
            .create_worktree(origin.url(), "task/a", "main")
            .expect("second create");
        assert_eq!(first.path, second.path);
        assert!(!second.path.join("scratch.txt").exists());

        let head = second.git().rev_parse("HEAD").expect("head");
        assert_eq!(head, origin.head("main").expect("origin head"));
        assert!(second.changed_files().expect("status").is_empty());
    }

    #[test]
    fn concurrent_creates_share_one_clone() {
        let origin = TestOrigin::new().expect("origin");
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(temp.path());
        let branches = ["task/a", "task/b", "task/c", "task/d"];

        let (shared, url) = (&manager, origin.url());
        let created: Vec<Result<Worktree>> = std::thread::scope(|scope| {
            let handles: Vec<_> = branches
                .iter()
                .map(|branch| scope.spawn(move || shared.create_worktree(url, branch, "main")))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("create thread"))
                .collect()
        });

        for (branch, result) in branches.iter().zip(created) {
            let wt = result.unwrap_or_else(|err| panic!("create {branch}: {err:#}"));
            assert_eq!(wt.repo_dir, manager.repo_dir(origin.url()));
            assert!(wt.path.join("package.json").exists());
        }
        let repos: Vec<_> = std::fs::read_dir(temp.path().join("repos"))
            .expect("repos dir")
            .flatten()
            .collect();
        assert_eq!(repos.len(), 1);
    }

    #[test]
    fn commit_without_changes_fails() {
        let origin = TestOrigin::new().expect("origin");
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(temp.path());
        let wt = manager
            .create_worktree(origin.url(), "task/clean", "main")
            .expect("create");

        let err = wt.commit("nothing", &bot()).unwrap_err();
        assert!(err.to_string().contains("no changes"));
    }

    #[test]
    fn commit_and_push_publish_branch() {
        let origin = TestOrigin::new().expect("origin");
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(temp.path());
        let wt = manager
            .create_worktree(origin.url(), "task/push", "main")
            .expect("create");

        std::fs::write(wt.path.join("feature.txt"), "feature").expect("write");
        assert_eq!(wt.changed_files().expect("status"), vec!["feature.txt"]);
        wt.commit("Add feature\n", &bot()).expect("commit");
        wt.push().expect("push");

        let pushed = origin.head("task/push").expect("pushed branch");
        assert_eq!(pushed, wt.git().rev_parse("HEAD").expect("head"));
        assert_eq!(
            origin.author_of("task/push").expect("author"),
            "autoship-bot <bot@autoship.invalid>"
        );
    }

    #[test]
    fn delete_worktree_removes_directory() {
        let origin = TestOrigin::new().expect("origin");
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(temp.path());
        let wt = manager
            .create_worktree(origin.url(), "task/gone", "main")
            .expect("create");

        assert!(manager.delete_worktree(&wt));
        assert!(!wt.path.exists());
        // Deleting again is harmless.
        assert!(manager.delete_worktree(&wt));
    }

    #[test]
    fn reap_removes_only_old_worktrees() {
        let origin = TestOrigin::new().expect("origin");
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(temp.path());
        let wt = manager
            .create_worktree(origin.url(), "task/keep", "main")
            .expect("create");

        assert!(manager.reap_stale(Duration::from_secs(3600)).is_empty());
        assert!(wt.path.exists());
        let removed = manager.reap_stale(Duration::ZERO);
        assert_eq!(removed, vec![wt.path.clone()]);
    }
}
