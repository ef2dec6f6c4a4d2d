//! On-disk persistence for one project's ledger and progress log.
//!
//! Layout: `<data_dir>/<project>/ledger.json` and `<data_dir>/<project>/progress.md`.
//! Both are replaced atomically (temp file + rename) so a crash never leaves a
//! half-written snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use crate::core::ledger::Ledger;

const LEDGER_FILE: &str = "ledger.json";
const PROGRESS_FILE: &str = "progress.md";

/// Files backing one project actor.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    project: String,
    dir: PathBuf,
}

impl LedgerStore {
    pub fn new(data_dir: &Path, project: &str) -> Self {
        Self {
            project: project.to_string(),
            dir: data_dir.join(project),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the ledger, or an empty one when nothing was persisted yet.
    pub fn load_ledger(&self) -> Result<Ledger> {
        let path = self.dir.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(Ledger::empty(&self.project, Utc::now()));
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let ledger: Ledger =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        if ledger.project_name != self.project {
            return Err(anyhow!(
                "{} belongs to project {}, expected {}",
                path.display(),
                ledger.project_name,
                self.project
            ));
        }
        Ok(ledger)
    }

    pub fn save_ledger(&self, ledger: &Ledger) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(ledger).context("serialize ledger")?;
        buf.push('\n');
        write_atomic(&self.dir.join(LEDGER_FILE), &buf)
    }

    /// Load the flat progress log (empty when absent).
    pub fn load_progress(&self) -> Result<String> {
        let path = self.dir.join(PROGRESS_FILE);
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn save_progress(&self, progress: &str) -> Result<()> {
        write_atomic(&self.dir.join(PROGRESS_FILE), progress)
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {}", path.display()))?
        .to_string_lossy();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn missing_files_load_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(temp.path(), "web");
        let ledger = store.load_ledger().expect("load");
        assert_eq!(ledger.project_name, "web");
        assert!(ledger.tasks.is_empty());
        assert_eq!(store.load_progress().expect("progress"), "");
    }

    #[test]
    fn ledger_and_progress_persist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(temp.path(), "web");
        let mut ledger = store.load_ledger().expect("load");
        ledger.enqueue(&task("1"), Utc::now());
        store.save_ledger(&ledger).expect("save");
        store.save_progress("## entry\n").expect("save progress");

        let reopened = LedgerStore::new(temp.path(), "web");
        assert_eq!(reopened.load_ledger().expect("reload"), ledger);
        assert_eq!(reopened.load_progress().expect("progress"), "## entry\n");
        assert!(!reopened.dir().join(".ledger.json.tmp").exists());
    }

    #[test]
    fn foreign_ledger_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let web = LedgerStore::new(temp.path(), "web");
        web.save_ledger(&Ledger::empty("api", Utc::now()))
            .expect("save");
        assert!(web.load_ledger().is_err());
    }
}
