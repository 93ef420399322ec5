//! Disposable install environments and the installer adapter.
//!
//! The [`Installer`] trait decouples validation from real package managers.
//! Tests use scripted installers that return canned reports without spawning
//! processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tracing::{debug, instrument, warn};

use crate::io::config::EcosystemProfile;
use crate::io::process::run_command_with_timeout;

/// A freshly created directory holding one materialized candidate manifest.
///
/// Every validation attempt creates its own; the directory is removed on
/// [`InstallEnv::close`] or when the value is dropped.
#[derive(Debug)]
pub struct InstallEnv {
    dir: TempDir,
    manifest_path: PathBuf,
}

impl InstallEnv {
    pub fn create(manifest_file: &str, content: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("depfix-env-")
            .tempdir()
            .context("create install environment")?;
        let manifest_path = dir.path().join(manifest_file);
        fs::write(&manifest_path, content)
            .with_context(|| format!("write {}", manifest_path.display()))?;
        debug!(env = %dir.path().display(), "created install environment");
        Ok(Self { dir, manifest_path })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Remove the environment, logging rather than failing on cleanup errors.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!(env = %path.display(), err = %err, "failed to remove install environment");
        } else {
            debug!(env = %path.display(), "removed install environment");
        }
    }
}

/// Result of one installer step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr.
    pub output: String,
}

impl InstallReport {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            timed_out: false,
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: false,
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }

    pub fn timed_out(output: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: true,
            exit_code: None,
            output: output.into(),
        }
    }
}

/// Abstraction over ecosystem package managers.
///
/// Optional steps return `Ok(None)` when the ecosystem does not define them.
/// `Err` means the step could not be run at all (e.g. the binary is missing).
pub trait Installer {
    fn provision(&self, env: &InstallEnv) -> Result<Option<InstallReport>>;
    fn install(&self, env: &InstallEnv) -> Result<InstallReport>;
    fn smoke_check(&self, env: &InstallEnv, package: &str) -> Result<Option<InstallReport>>;
    fn check(&self, env: &InstallEnv) -> Result<Option<InstallReport>>;
}

/// Installer driven by the command vectors of an [`EcosystemProfile`].
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    profile: EcosystemProfile,
    output_limit_bytes: usize,
}

impl CommandInstaller {
    pub fn new(profile: EcosystemProfile, output_limit_bytes: usize) -> Self {
        Self {
            profile,
            output_limit_bytes,
        }
    }

    #[instrument(skip_all, fields(step = %step, timeout_secs = timeout_secs))]
    fn run_step(
        &self,
        step: &str,
        argv: &[String],
        env: &InstallEnv,
        package: Option<&str>,
        timeout_secs: u64,
    ) -> Result<InstallReport> {
        let argv: Vec<String> = argv
            .iter()
            .map(|arg| substitute(arg, env, package))
            .collect();
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("{step} command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(env.dir());
        debug!(step, command = %argv.join(" "), "running installer step");
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(timeout_secs),
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {step} command"))?;
        let text = output.combined_text();
        Ok(if output.timed_out {
            InstallReport::timed_out(text)
        } else {
            InstallReport {
                success: output.status.success(),
                timed_out: false,
                exit_code: output.status.code(),
                output: text,
            }
        })
    }

    fn optional_step(
        &self,
        step: &str,
        argv: &[String],
        env: &InstallEnv,
        package: Option<&str>,
        timeout_secs: u64,
    ) -> Result<Option<InstallReport>> {
        if argv.is_empty() {
            return Ok(None);
        }
        self.run_step(step, argv, env, package, timeout_secs).map(Some)
    }
}

impl Installer for CommandInstaller {
    fn provision(&self, env: &InstallEnv) -> Result<Option<InstallReport>> {
        self.optional_step(
            "provision",
            &self.profile.provision,
            env,
            None,
            self.profile.provision_timeout_secs,
        )
    }

    fn install(&self, env: &InstallEnv) -> Result<InstallReport> {
        self.run_step(
            "install",
            &self.profile.install,
            env,
            None,
            self.profile.install_timeout_secs,
        )
    }

    fn smoke_check(&self, env: &InstallEnv, package: &str) -> Result<Option<InstallReport>> {
        self.optional_step(
            "smoke",
            &self.profile.smoke,
            env,
            Some(package),
            self.profile.smoke_timeout_secs,
        )
    }

    fn check(&self, env: &InstallEnv) -> Result<Option<InstallReport>> {
        self.optional_step(
            "check",
            &self.profile.check,
            env,
            None,
            self.profile.smoke_timeout_secs,
        )
    }
}

/// Import name of a distribution: lower-case with `-` and `.` mapped to `_`.
pub fn module_name(package: &str) -> String {
    package.to_ascii_lowercase().replace(['-', '.'], "_")
}

fn substitute(arg: &str, env: &InstallEnv, package: Option<&str>) -> String {
    let mut out = arg
        .replace("{env}", &env.dir().to_string_lossy())
        .replace("{manifest}", &env.manifest_path().to_string_lossy());
    if let Some(package) = package {
        out = out
            .replace("{package}", package)
            .replace("{module}", &module_name(package));
    }
    out
}
