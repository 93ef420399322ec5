//! Shared data model for remediation sessions.
//!
//! Findings and targets come from the discovery/research collaborators and are
//! never mutated here. Candidates and outcomes are created once per attempt.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::requirement::same_package;
use crate::error::RemediationError;

/// Package ecosystem a manifest belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ecosystem {
    #[serde(rename = "PyPI", alias = "pypi")]
    PyPi,
    #[serde(rename = "npm")]
    Npm,
}

impl Ecosystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Ecosystem::PyPi => "PyPI",
            Ecosystem::Npm => "npm",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pypi" | "python" | "pip" => Ok(Ecosystem::PyPi),
            "npm" | "node" => Ok(Ecosystem::Npm),
            other => Err(format!("unsupported ecosystem '{other}' (expected pypi or npm)")),
        }
    }
}

/// A vulnerable package+version detected in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    /// Advisory identifier (e.g. `CVE-2023-30861`).
    pub advisory_id: String,
    pub package: String,
    pub current_version: String,
    pub ecosystem: Ecosystem,
    /// Manifest file, absolute or relative to the repository root.
    pub manifest_path: PathBuf,
    #[serde(default)]
    pub severity: Option<f64>,
}

/// The version a vulnerable package should move to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureVersionTarget {
    pub package: String,
    pub current_version: String,
    pub secure_version: String,
    pub ecosystem: Ecosystem,
}

/// One package constraint change inside a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    pub package: String,
    /// Constraint as it appears in the original manifest (e.g. `==2.0.1`, `^4.17.1`).
    pub old: String,
    pub new: String,
}

impl fmt::Display for VersionEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.package, self.old, self.new)
    }
}

/// Which generation path produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "single-package")]
    SinglePackage,
    #[serde(rename = "rule-engine")]
    RuleEngine,
    #[serde(rename = "oracle-fallback")]
    Oracle,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::SinglePackage => "single-package",
            Provenance::RuleEngine => "rule-engine",
            Provenance::Oracle => "oracle-fallback",
        }
    }
}

/// A proposed, not-yet-verified manifest edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchCandidate {
    pub manifest_path: PathBuf,
    pub ecosystem: Ecosystem,
    /// Package the finding targets.
    pub package: String,
    pub secure_version: String,
    /// The true original manifest content, identical for every attempt of a session.
    pub original: String,
    pub proposed: String,
    /// Ordered edits; the target package edit comes first when present.
    pub edits: Vec<VersionEdit>,
    pub attempt: u32,
    pub provenance: Provenance,
}

impl PatchCandidate {
    /// Edits to packages other than the target ("refinement changes").
    pub fn refinement_changes(&self) -> Vec<&VersionEdit> {
        self.edits
            .iter()
            .filter(|edit| !same_package(&edit.package, &self.package))
            .collect()
    }
}

/// Classification of a failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Declared constraints cannot be satisfied together.
    Conflict,
    /// A package failed to compile/build.
    BuildFailure,
    Timeout,
    /// The disposable environment could not be prepared.
    Environment,
    /// Installer failed without a recognizable signature.
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub failure: Option<FailureKind>,
    pub conflicting_packages: Vec<String>,
    /// Free-text installer diagnostics used as refinement input.
    pub feedback: String,
    pub suggestions: Vec<String>,
    pub retryable: bool,
    /// Typed install-time error, when the failure maps onto one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemediationError>,
}

/// Result of validating exactly one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    /// Passed provisionally (tolerated timeout, host-only build failure).
    pub warning: bool,
    pub message: String,
    pub diagnostics: Diagnostics,
}

impl ValidationOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            warning: false,
            message: message.into(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Passed, but only because a known host-specific failure was tolerated.
    pub fn pass_with_warning(message: impl Into<String>, tolerated: FailureKind) -> Self {
        Self {
            passed: true,
            warning: true,
            message: message.into(),
            diagnostics: Diagnostics {
                failure: Some(tolerated),
                ..Diagnostics::default()
            },
        }
    }

    /// Retryable dependency conflict.
    pub fn conflict(
        message: impl Into<String>,
        feedback: impl Into<String>,
        packages: Vec<String>,
    ) -> Self {
        Self {
            passed: false,
            warning: false,
            message: message.into(),
            diagnostics: Diagnostics {
                failure: Some(FailureKind::Conflict),
                conflicting_packages: packages,
                feedback: feedback.into(),
                suggestions: Vec::new(),
                retryable: true,
                error: None,
            },
        }
    }

    /// Non-retryable failure.
    pub fn failure(
        kind: FailureKind,
        message: impl Into<String>,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            passed: false,
            warning: false,
            message: message.into(),
            diagnostics: Diagnostics {
                failure: Some(kind),
                conflicting_packages: Vec::new(),
                feedback: feedback.into(),
                suggestions: Vec::new(),
                retryable: false,
                error: None,
            },
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.diagnostics.suggestions = suggestions;
        self
    }

    pub fn with_error(mut self, error: RemediationError) -> Self {
        self.diagnostics.error = Some(error);
        self
    }

    pub fn retryable(&self) -> bool {
        !self.passed && self.diagnostics.retryable
    }
}
