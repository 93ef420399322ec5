//! Refinement orchestrator: the bounded generate / validate / refine loop for
//! one finding.
//!
//! Attempt 1 is the single-package patch. Later attempts ask the
//! [`Coordinator`] for a coordinated edit computed from the original manifest
//! plus the accumulated feedback. The loop ends in exactly one of
//! [`TerminalState`]'s variants.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::coordinate::{CoordinatedEdit, CoordinationRequest, Coordinator};
use crate::core::feedback::{AttemptFeedback, FeedbackLog};
use crate::core::patcher::{ManifestFormat, patch_manifest};
use crate::core::requirement::same_package;
use crate::core::session::{RefinementSession, SessionState, TerminalState};
use crate::core::types::{
    Ecosystem, FailureKind, PatchCandidate, Provenance, SecureVersionTarget, ValidationOutcome,
    VersionEdit, VulnerabilityFinding,
};
use crate::error::RemediationError;
use crate::io::config::DepfixConfig;
use crate::io::manifest::{read_manifest, resolve_manifest_path};
use crate::validate::Validator;

/// One finding plus the version it should move to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub finding: VulnerabilityFinding,
    pub target: SecureVersionTarget,
}

impl RemediationRequest {
    pub fn validate(&self) -> Result<(), String> {
        if !same_package(&self.finding.package, &self.target.package) {
            return Err(format!(
                "finding is for {} but target is for {}",
                self.finding.package, self.target.package
            ));
        }
        if self.finding.ecosystem != self.target.ecosystem {
            return Err(format!(
                "finding ecosystem {} does not match target ecosystem {}",
                self.finding.ecosystem, self.target.ecosystem
            ));
        }
        if self.target.secure_version.trim().is_empty() {
            return Err("target secure_version must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl From<&DepfixConfig> for SessionConfig {
    fn from(config: &DepfixConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
        }
    }
}

/// A candidate and the outcome of validating exactly that candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub candidate: PatchCandidate,
    pub outcome: ValidationOutcome,
}

/// Everything observable about a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub advisory_id: String,
    pub package: String,
    pub ecosystem: Ecosystem,
    pub manifest_path: PathBuf,
    pub state: TerminalState,
    /// Highest attempt number reached, including one whose generation failed.
    pub attempts_started: u32,
    /// Candidates that reached the validator.
    pub validations: u32,
    pub budget: u32,
    /// Final outcome message or abort reason, verbatim.
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemediationError>,
    pub attempts: Vec<AttemptRecord>,
    pub feedback: FeedbackLog,
}

/// Contract handed to the pull-request collaborator for a succeeded session.
#[derive(Debug, Clone, Serialize)]
pub struct Handoff<'a> {
    pub advisory_id: &'a str,
    pub manifest_path: &'a Path,
    pub original: &'a str,
    pub patched: &'a str,
    pub refinement_changes: Vec<&'a VersionEdit>,
    pub attempts: u32,
    pub provenance: Provenance,
    pub outcome: &'a ValidationOutcome,
}

impl SessionReport {
    fn new(request: &RemediationRequest, budget: u32) -> Self {
        Self {
            advisory_id: request.finding.advisory_id.clone(),
            package: request.target.package.clone(),
            ecosystem: request.target.ecosystem,
            manifest_path: request.finding.manifest_path.clone(),
            state: TerminalState::Aborted,
            attempts_started: 0,
            validations: 0,
            budget,
            reason: String::new(),
            error: None,
            attempts: Vec::new(),
            feedback: FeedbackLog::default(),
        }
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn handoff(&self) -> Option<Handoff<'_>> {
        if self.state != TerminalState::Succeeded {
            return None;
        }
        let last = self.last_attempt()?;
        Some(Handoff {
            advisory_id: &self.advisory_id,
            manifest_path: &last.candidate.manifest_path,
            original: &last.candidate.original,
            patched: &last.candidate.proposed,
            refinement_changes: last.candidate.refinement_changes(),
            attempts: last.candidate.attempt,
            provenance: last.candidate.provenance,
            outcome: &last.outcome,
        })
    }
}

/// Run one finding to a terminal state.
///
/// `on_attempt` is called after every validation with the candidate and its
/// outcome. `Err` is returned only for an invalid request or a broken state
/// machine; every remediation failure ends in a [`SessionReport`].
#[instrument(skip_all, fields(advisory = %request.finding.advisory_id, package = %request.target.package))]
pub fn run_session<V: Validator, C: Coordinator + ?Sized, F: FnMut(&AttemptRecord)>(
    root: &Path,
    request: &RemediationRequest,
    validator: &V,
    coordinator: &C,
    config: &SessionConfig,
    mut on_attempt: F,
) -> Result<SessionReport> {
    request
        .validate()
        .map_err(|err| anyhow!("invalid request {}: {err}", request.finding.advisory_id))?;

    let mut session = RefinementSession::new(config.max_attempts);
    let mut report = SessionReport::new(request, session.budget());
    session.begin().map_err(|err| anyhow!(err))?;

    let target = &request.target;
    let ecosystem = target.ecosystem;
    let format = ManifestFormat::for_ecosystem(ecosystem);

    let loaded = resolve_manifest_path(root, &request.finding.manifest_path)
        .and_then(|path| read_manifest(&path).map(|content| (path, content)));
    let (manifest_path, original) = match loaded {
        Ok(loaded) => loaded,
        Err(err) => return abort(session, report, err.to_string(), Some(err)),
    };
    report.manifest_path = manifest_path.clone();
    let manifest_file = manifest_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut feedback = FeedbackLog::default();
    let mut prior_failures: Vec<String> = Vec::new();

    loop {
        let attempt = session.attempt();
        let generated = if attempt == 1 {
            patch_manifest(format, &original, target).map(|patched| {
                Some(CoordinatedEdit {
                    content: patched.content,
                    edits: vec![patched.edit],
                    provenance: Provenance::SinglePackage,
                })
            })
        } else {
            coordinator.coordinate(&CoordinationRequest {
                format,
                ecosystem,
                manifest_file: &manifest_file,
                original: &original,
                target,
                feedback: &feedback,
                prior_failures: &prior_failures,
                attempt,
            })
        };
        let edit = match generated {
            Ok(Some(edit)) => edit,
            Ok(None) => {
                let last = report
                    .last_attempt()
                    .map(|record| record.outcome.message.as_str())
                    .unwrap_or_default();
                let reason = format!("no further coordination possible; last failure: {last}");
                report.feedback = feedback;
                return abort(session, report, reason, None);
            }
            Err(err) => {
                warn!(attempt, err = %err, "candidate generation failed");
                report.feedback = feedback;
                return abort(session, report, err.to_string(), Some(err));
            }
        };

        let candidate = PatchCandidate {
            manifest_path: manifest_path.clone(),
            ecosystem,
            package: target.package.clone(),
            secure_version: target.secure_version.clone(),
            original: original.clone(),
            proposed: edit.content,
            edits: edit.edits,
            attempt,
            provenance: edit.provenance,
        };
        session.candidate_ready().map_err(|err| anyhow!(err))?;

        let outcome = match validator.validate(&candidate) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(attempt, err = %format!("{err:#}"), "validation could not run");
                ValidationOutcome::failure(
                    FailureKind::Environment,
                    format!("Validation could not run: {err:#}"),
                    String::new(),
                )
            }
        };
        let next = session.record_outcome(&outcome).map_err(|err| anyhow!(err))?;
        info!(
            attempt,
            provenance = candidate.provenance.as_str(),
            passed = outcome.passed,
            warning = outcome.warning,
            next = ?next,
            "attempt validated"
        );

        let record = AttemptRecord { candidate, outcome };
        on_attempt(&record);
        if !record.outcome.passed {
            feedback.push(AttemptFeedback::from_outcome(attempt, &record.outcome));
            prior_failures.push(record.candidate.proposed.clone());
        }
        report.attempts.push(record);

        if next != SessionState::Refining {
            break;
        }
        session.advance().map_err(|err| anyhow!(err))?;
    }

    let state = session
        .terminal()
        .ok_or_else(|| anyhow!("session ended in non-terminal state {:?}", session.state()))?;
    if let Some(last) = report.attempts.last() {
        report.reason = last.outcome.message.clone();
        if !last.outcome.passed {
            report.error = last.outcome.diagnostics.error.clone();
        }
    }
    report.state = state;
    report.attempts_started = session.attempt();
    report.validations = session.validations();
    report.feedback = feedback;
    info!(state = state.as_str(), validations = report.validations, "session finished");
    Ok(report)
}

fn abort(
    mut session: RefinementSession,
    mut report: SessionReport,
    reason: String,
    error: Option<RemediationError>,
) -> Result<SessionReport> {
    session.abort().map_err(|err| anyhow!(err))?;
    warn!(reason = %reason, "session aborted");
    report.state = TerminalState::Aborted;
    report.attempts_started = session.attempt();
    report.validations = session.validations();
    report.reason = reason;
    report.error = error;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::{
        FLASK_PINNED, ScriptedValidator, flask_request, write_manifest,
    };

    #[test]
    fn request_validation_rejects_mismatched_records() {
        let mut request = flask_request("requirements.txt", "2.0.1", "2.3.3");
        assert!(request.validate().is_ok());
        request.target.package = "django".to_string();
        assert!(request.validate().is_err());

        let mut request = flask_request("requirements.txt", "2.0.1", "2.3.3");
        request.target.ecosystem = Ecosystem::Npm;
        assert!(request.validate().is_err());
    }

    #[test]
    fn missing_manifest_aborts_without_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let validator = ScriptedValidator::new(Vec::new());
        let coordinator = crate::coordinate::CoordinatorChain::default();
        let report = run_session(
            temp.path(),
            &flask_request("requirements.txt", "2.0.1", "2.3.3"),
            &validator,
            &coordinator,
            &SessionConfig::default(),
            |_| {},
        )
        .expect("session");
        assert_eq!(report.state, TerminalState::Aborted);
        assert_eq!(report.validations, 0);
        assert!(matches!(
            report.error,
            Some(RemediationError::ManifestNotFound { .. })
        ));
        assert!(validator.seen().is_empty());
    }

    #[test]
    fn validator_errors_become_non_retryable_outcomes() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "requirements.txt", FLASK_PINNED);
        let validator = ScriptedValidator::with_results(vec![Err("disk full".to_string())]);
        let coordinator = crate::coordinate::CoordinatorChain::default();
        let report = run_session(
            temp.path(),
            &flask_request("requirements.txt", "2.0.1", "2.3.3"),
            &validator,
            &coordinator,
            &SessionConfig::default(),
            |_| {},
        )
        .expect("session");
        assert_eq!(report.state, TerminalState::Aborted);
        assert_eq!(report.validations, 1);
        assert!(report.reason.contains("disk full"), "{}", report.reason);
        assert_eq!(
            fs::read_to_string(temp.path().join("requirements.txt")).expect("read"),
            FLASK_PINNED,
            "the manifest on disk is never written"
        );
    }

    #[test]
    fn handoff_only_exists_for_succeeded_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "requirements.txt", FLASK_PINNED);
        let validator = ScriptedValidator::new(vec![ValidationOutcome::pass("ok")]);
        let coordinator = crate::coordinate::CoordinatorChain::default();
        let mut seen = Vec::new();
        let report = run_session(
            temp.path(),
            &flask_request("requirements.txt", "2.0.1", "2.3.3"),
            &validator,
            &coordinator,
            &SessionConfig::default(),
            |record| seen.push(record.candidate.attempt),
        )
        .expect("session");
        assert_eq!(seen, vec![1]);
        let handoff = report.handoff().expect("handoff");
        assert_eq!(handoff.original, FLASK_PINNED);
        assert!(handoff.patched.starts_with("Flask==2.3.3\n"));
        assert!(handoff.refinement_changes.is_empty());
        assert_eq!(handoff.attempts, 1);

        let aborted = SessionReport {
            state: TerminalState::Aborted,
            ..report
        };
        assert!(aborted.handoff().is_none());
    }
}
