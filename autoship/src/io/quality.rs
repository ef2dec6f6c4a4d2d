//! Quality gate: install, typecheck, test and lint a JavaScript/TypeScript project.
//!
//! Checks are driven by the `scripts` table of `package.json`. A missing script is
//! a soft pass (tests) or triggers a fallback (typecheck); lint never fails the gate.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::QualityConfig;
use crate::io::process::run_command_with_timeout;

pub const MANIFEST: &str = "package.json";

/// Structured verdict of one quality gate run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub typecheck: bool,
    pub tests: bool,
    /// Advisory only.
    pub lint: bool,
    pub errors: Vec<String>,
}

impl QualityReport {
    /// Whether the change may be committed (`typecheck && tests`).
    pub fn passed(&self) -> bool {
        self.typecheck && self.tests
    }
}

/// Outcome of the dependency install step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
    NoManifest,
}

/// Abstraction over quality gate backends.
pub trait QualityGate: Send + Sync {
    /// Install dependencies if they are not already present.
    fn install(&self, workdir: &Path) -> Result<InstallOutcome>;

    /// Run every check. Never errors: problems are reported in the verdict.
    fn run_all(&self, workdir: &Path) -> QualityReport;
}

/// Which command a check resolves to for a given manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckPlan {
    Run(Vec<String>),
    /// Nothing to run; the check passes vacuously.
    Skip,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// Quality gate that runs `package.json` scripts through a package manager.
#[derive(Debug, Clone)]
pub struct ScriptQualityGate {
    config: QualityConfig,
}

impl ScriptQualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.check_timeout_secs)
    }

    fn script(&self, name: &str) -> Vec<String> {
        vec![
            self.config.package_manager.clone(),
            "run".to_string(),
            name.to_string(),
        ]
    }

    fn plan_typecheck(&self, manifest: &Manifest, workdir: &Path) -> CheckPlan {
        if manifest.scripts.contains_key("typecheck") {
            CheckPlan::Run(self.script("typecheck"))
        } else if workdir.join("tsconfig.json").exists() {
            CheckPlan::Run(self.config.typecheck_fallback.clone())
        } else {
            CheckPlan::Skip
        }
    }

    fn plan_script(&self, manifest: &Manifest, name: &str) -> CheckPlan {
        if manifest.scripts.contains_key(name) {
            CheckPlan::Run(self.script(name))
        } else {
            CheckPlan::Skip
        }
    }

    /// Run one planned check; returns the failure description, if any.
    #[instrument(skip_all, fields(check = label))]
    fn run_check(&self, label: &str, plan: &CheckPlan, workdir: &Path) -> Option<String> {
        let CheckPlan::Run(argv) = plan else {
            debug!("no command for check, passing");
            return None;
        };
        let Some((program, args)) = argv.split_first() else {
            return None;
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir).env("CI", "true");

        match run_command_with_timeout(cmd, None, self.timeout(), self.config.output_limit_bytes)
        {
            Ok(output) if output.success() => {
                debug!("check passed");
                None
            }
            Ok(output) if output.timed_out => Some(format!(
                "{label} timed out after {}s",
                self.config.check_timeout_secs
            )),
            Ok(output) => Some(format!(
                "{label} failed (exit {:?}):\n{}",
                output.status.code(),
                tail(&output.combined(label), self.config.error_excerpt_chars)
            )),
            Err(err) => Some(format!("{label} could not run: {err:#}")),
        }
    }
}

impl QualityGate for ScriptQualityGate {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn install(&self, workdir: &Path) -> Result<InstallOutcome> {
        if !workdir.join(MANIFEST).exists() {
            return Ok(InstallOutcome::NoManifest);
        }
        if workdir.join("node_modules").exists() {
            return Ok(InstallOutcome::AlreadyPresent);
        }
        info!("installing dependencies");
        let mut cmd = Command::new(&self.config.package_manager);
        cmd.arg("install").current_dir(workdir);
        let output = run_command_with_timeout(
            cmd,
            None,
            self.timeout(),
            self.config.output_limit_bytes,
        )
        .context("run dependency install")?;
        if !output.success() {
            anyhow::bail!(
                "dependency install failed:\n{}",
                tail(&output.combined("install"), self.config.error_excerpt_chars)
            );
        }
        Ok(InstallOutcome::Installed)
    }

    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn run_all(&self, workdir: &Path) -> QualityReport {
        let manifest = match read_manifest(workdir) {
            Ok(Some(m)) => m,
            Ok(None) => {
                return QualityReport {
                    errors: vec![format!("no {MANIFEST} found")],
                    ..QualityReport::default()
                };
            }
            Err(err) => {
                return QualityReport {
                    errors: vec![format!("{err:#}")],
                    ..QualityReport::default()
                };
            }
        };

        let mut report = QualityReport::default();

        let typecheck = self.plan_typecheck(&manifest, workdir);
        match self.run_check("typecheck", &typecheck, workdir) {
            None => report.typecheck = true,
            Some(err) => report.errors.push(err),
        }

        let tests = self.plan_script(&manifest, "test");
        match self.run_check("tests", &tests, workdir) {
            None => report.tests = true,
            Some(err) => report.errors.push(err),
        }

        let lint = self.plan_script(&manifest, "lint");
        match self.run_check("lint", &lint, workdir) {
            None => report.lint = true,
            Some(err) => warn!(err = %err, "lint failed (advisory)"),
        }

        info!(
            typecheck = report.typecheck,
            tests = report.tests,
            lint = report.lint,
            "quality gate finished"
        );
        report
    }
}

fn read_manifest(workdir: &Path) -> Result<Option<Manifest>> {
    let path = workdir.join(MANIFEST);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let manifest =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(manifest))
}

/// Keep the last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
