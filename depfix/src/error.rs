//! Typed error taxonomy for remediation sessions.
//!
//! Generation-time variants abort a session immediately. Install-time variants
//! describe validation outcomes and only `InstallConflict` is retryable.
//! `OracleUnavailable` never ends a session on its own.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationError {
    #[error("dependency manifest not found: {}", path.display())]
    ManifestNotFound { path: PathBuf },

    #[error("could not find package {package}=={version} in manifest")]
    PackageLineNotFound { package: String, version: String },

    #[error("malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    #[error("dependency conflict between: {}", packages.join(", "))]
    InstallConflict { packages: Vec<String> },

    #[error("install build failure: {message}")]
    InstallBuildFailure { message: String },

    #[error("installation timed out after {timeout_secs}s")]
    InstallTimeout { timeout_secs: u64 },

    #[error("advisory oracle unavailable: {reason}")]
    OracleUnavailable { reason: String },
}

impl RemediationError {
    /// Errors raised while producing a candidate. Retrying cannot help.
    pub fn is_generation_error(&self) -> bool {
        matches!(
            self,
            Self::ManifestNotFound { .. }
                | Self::PackageLineNotFound { .. }
                | Self::MalformedManifest { .. }
        )
    }
}
