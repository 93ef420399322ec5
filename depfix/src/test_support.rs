//! Scripted doubles and fixtures shared by unit and integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::coordinate::{CoordinatedEdit, CoordinationRequest, Coordinator};
use crate::core::patcher::{ManifestFormat, diff_declarations};
use crate::core::types::{
    Ecosystem, PatchCandidate, Provenance, SecureVersionTarget, ValidationOutcome,
    VulnerabilityFinding,
};
use crate::error::RemediationError;
use crate::io::installer::{InstallEnv, InstallReport, Installer};
use crate::io::oracle::Oracle;
use crate::io::registry::Registry;
use crate::remediate::RemediationRequest;
use crate::validate::Validator;

pub const FLASK_SIMPLE: &str = "Flask==2.0.1\nrequests==2.25.0\n";
pub const FLASK_PINNED: &str = "Flask==2.0.1\nrequests==2.25.0\nWerkzeug==2.0.0\nMarkupSafe==2.0.0\n";

pub fn flask_target(current: &str, secure: &str) -> SecureVersionTarget {
    SecureVersionTarget {
        package: "Flask".to_string(),
        current_version: current.to_string(),
        secure_version: secure.to_string(),
        ecosystem: Ecosystem::PyPi,
    }
}

pub fn flask_request(manifest_path: &str, current: &str, secure: &str) -> RemediationRequest {
    RemediationRequest {
        finding: VulnerabilityFinding {
            advisory_id: "CVE-2023-30861".to_string(),
            package: "flask".to_string(),
            current_version: current.to_string(),
            ecosystem: Ecosystem::PyPi,
            manifest_path: PathBuf::from(manifest_path),
            severity: Some(7.5),
        },
        target: flask_target(current, secure),
    }
}

pub fn write_manifest(root: &Path, name: &str, content: &str) -> PathBuf {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create manifest dir");
    }
    fs::write(&path, content).expect("write manifest");
    path
}

/// Requirements-format Flask candidate with edits diffed from `original`.
pub fn candidate_for(
    original: &str,
    proposed: &str,
    attempt: u32,
    provenance: Provenance,
) -> PatchCandidate {
    PatchCandidate {
        manifest_path: PathBuf::from("requirements.txt"),
        ecosystem: Ecosystem::PyPi,
        package: "Flask".to_string(),
        secure_version: "2.3.3".to_string(),
        original: original.to_string(),
        proposed: proposed.to_string(),
        edits: diff_declarations(ManifestFormat::Requirements, original, proposed)
            .expect("diff requirements"),
        attempt,
        provenance,
    }
}

/// Validator returning queued results in order and recording every candidate.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    script: RefCell<VecDeque<Result<ValidationOutcome, String>>>,
    seen: RefCell<Vec<PatchCandidate>>,
}

impl ScriptedValidator {
    pub fn new(outcomes: Vec<ValidationOutcome>) -> Self {
        Self::with_results(outcomes.into_iter().map(Ok).collect())
    }

    /// `Err` entries simulate the validator itself failing.
    pub fn with_results(results: Vec<Result<ValidationOutcome, String>>) -> Self {
        Self {
            script: RefCell::new(results.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<PatchCandidate> {
        self.seen.borrow().clone()
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, candidate: &PatchCandidate) -> Result<ValidationOutcome> {
        self.seen.borrow_mut().push(candidate.clone());
        match self.script.borrow_mut().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("validator script exhausted")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    Ok,
    Fail(String),
    TimedOut,
}

impl ScriptedStep {
    fn report(&self) -> InstallReport {
        match self {
            ScriptedStep::Ok => InstallReport::ok(""),
            ScriptedStep::Fail(output) => InstallReport::failed(1, output.clone()),
            ScriptedStep::TimedOut => InstallReport::timed_out("still resolving..."),
        }
    }
}

/// Installer with fixed per-step results that records what it was asked to do.
#[derive(Debug)]
pub struct ScriptedInstaller {
    provision: ScriptedStep,
    install: ScriptedStep,
    smoke: ScriptedStep,
    calls: RefCell<Vec<&'static str>>,
    env_dirs: RefCell<Vec<PathBuf>>,
    manifests: RefCell<Vec<String>>,
}

impl ScriptedInstaller {
    pub fn new(provision: ScriptedStep, install: ScriptedStep, smoke: ScriptedStep) -> Self {
        Self {
            provision,
            install,
            smoke,
            calls: RefCell::new(Vec::new()),
            env_dirs: RefCell::new(Vec::new()),
            manifests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    pub fn env_dirs(&self) -> Vec<PathBuf> {
        self.env_dirs.borrow().clone()
    }

    /// Manifest content found in each environment at install time.
    pub fn manifests(&self) -> Vec<String> {
        self.manifests.borrow().clone()
    }
}

impl Installer for ScriptedInstaller {
    fn provision(&self, _env: &InstallEnv) -> Result<Option<InstallReport>> {
        self.calls.borrow_mut().push("provision");
        Ok(Some(self.provision.report()))
    }

    fn install(&self, env: &InstallEnv) -> Result<InstallReport> {
        self.calls.borrow_mut().push("install");
        self.env_dirs.borrow_mut().push(env.dir().to_path_buf());
        self.manifests
            .borrow_mut()
            .push(fs::read_to_string(env.manifest_path())?);
        Ok(self.install.report())
    }

    fn smoke_check(&self, _env: &InstallEnv, _package: &str) -> Result<Option<InstallReport>> {
        self.calls.borrow_mut().push("smoke");
        Ok(Some(self.smoke.report()))
    }

    fn check(&self, _env: &InstallEnv) -> Result<Option<InstallReport>> {
        self.calls.borrow_mut().push("check");
        Ok(Some(InstallReport::ok("No broken requirements found.")))
    }
}

/// Registry answering every lookup the same way.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    exists: bool,
    lookups: RefCell<Vec<(String, String)>>,
}

impl FakeRegistry {
    pub fn new(exists: bool) -> Self {
        Self {
            exists,
            lookups: RefCell::new(Vec::new()),
        }
    }

    pub fn lookups(&self) -> Vec<(String, String)> {
        self.lookups.borrow().clone()
    }
}

impl Registry for FakeRegistry {
    fn version_exists(&self, _ecosystem: Ecosystem, package: &str, version: &str) -> Result<bool> {
        self.lookups
            .borrow_mut()
            .push((package.to_string(), version.to_string()));
        Ok(self.exists)
    }
}

/// Oracle returning queued responses and recording every prompt.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    responses: RefCell<VecDeque<Result<String, RemediationError>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<Result<String, RemediationError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn complete(&self, prompt: &str) -> Result<String, RemediationError> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(RemediationError::OracleUnavailable {
                    reason: "oracle script exhausted".to_string(),
                })
            })
    }
}

/// What a [`ScriptedCoordinator`] was given for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenCoordination {
    pub attempt: u32,
    pub original: String,
    pub feedback_entries: usize,
    pub prior_failures: usize,
}

/// Coordinator returning queued edits; an empty queue declines.
#[derive(Debug, Default)]
pub struct ScriptedCoordinator {
    edits: RefCell<VecDeque<Result<Option<CoordinatedEdit>, RemediationError>>>,
    seen: RefCell<Vec<SeenCoordination>>,
}

impl ScriptedCoordinator {
    pub fn new(edits: Vec<Result<Option<CoordinatedEdit>, RemediationError>>) -> Self {
        Self {
            edits: RefCell::new(edits.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SeenCoordination> {
        self.seen.borrow().clone()
    }
}

impl Coordinator for ScriptedCoordinator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError> {
        self.seen.borrow_mut().push(SeenCoordination {
            attempt: request.attempt,
            original: request.original.to_string(),
            feedback_entries: request.feedback.entries().len(),
            prior_failures: request.prior_failures.len(),
        });
        self.edits.borrow_mut().pop_front().unwrap_or(Ok(None))
    }
}
