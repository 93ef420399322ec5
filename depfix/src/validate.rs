//! Validation runner: install one candidate in a disposable environment and
//! classify the result.
//!
//! Each call creates its own [`InstallEnv`] and tears it down before returning,
//! whatever the outcome. Nothing persists between calls.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{Classification, FailureClassifier, PatternClassifier};
use crate::core::rules::RuleSet;
use crate::core::types::{Ecosystem, FailureKind, PatchCandidate, ValidationOutcome};
use crate::error::RemediationError;
use crate::io::config::{DepfixConfig, EcosystemProfile};
use crate::io::installer::{CommandInstaller, InstallEnv, InstallReport, Installer};
use crate::io::registry::{HttpRegistry, Registry};

/// Characters of installer output quoted in an outcome message.
const MESSAGE_EXCERPT_CHARS: usize = 300;

/// Seam between the orchestrator and installation.
pub trait Validator {
    /// `Err` is reserved for failures of the validator itself; the orchestrator
    /// turns it into a non-retryable outcome.
    fn validate(&self, candidate: &PatchCandidate) -> Result<ValidationOutcome>;
}

impl<V: Validator + ?Sized> Validator for &V {
    fn validate(&self, candidate: &PatchCandidate) -> Result<ValidationOutcome> {
        (**self).validate(candidate)
    }
}

/// Ecosystem-specific knobs the runner needs besides the installer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub manifest_file: String,
    pub tolerate_timeout: bool,
    pub install_timeout_secs: u64,
}

impl ValidationPolicy {
    pub fn from_profile(profile: &EcosystemProfile) -> Self {
        Self {
            manifest_file: profile.manifest_file.clone(),
            tolerate_timeout: profile.tolerate_timeout,
            install_timeout_secs: profile.install_timeout_secs,
        }
    }
}

pub struct ValidationRunner<I, R, C> {
    installer: I,
    registry: R,
    classifier: C,
    rules: RuleSet,
    policy: ValidationPolicy,
}

impl ValidationRunner<CommandInstaller, HttpRegistry, PatternClassifier> {
    /// Runner backed by the configured installer commands and the public registries.
    pub fn from_config(config: &DepfixConfig, ecosystem: Ecosystem) -> Result<Self> {
        let profile = config.profile(ecosystem);
        Ok(Self::new(
            CommandInstaller::new(profile.clone(), config.output_limit_bytes),
            HttpRegistry::new(&config.registry)?,
            PatternClassifier::for_ecosystem(ecosystem)
                .with_toolchain_signatures(&profile.toolchain_signatures),
            config.rule_set(),
            ValidationPolicy::from_profile(profile),
        ))
    }
}

impl<I: Installer, R: Registry, C: FailureClassifier> ValidationRunner<I, R, C> {
    pub fn new(
        installer: I,
        registry: R,
        classifier: C,
        rules: RuleSet,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            installer,
            registry,
            classifier,
            rules,
            policy,
        }
    }

    fn validate_in(&self, env: &InstallEnv, candidate: &PatchCandidate) -> Result<ValidationOutcome> {
        if let Some(report) = self.installer.provision(env)?
            && !report.success
        {
            warn!(exit_code = ?report.exit_code, "environment provisioning failed");
            return Ok(ValidationOutcome::failure(
                FailureKind::Environment,
                format!(
                    "Environment provisioning failed: {}",
                    excerpt(&report.output)
                ),
                report.output,
            ));
        }

        let report = self.installer.install(env)?;
        if report.timed_out {
            return Ok(self.timeout_outcome(report));
        }
        if report.success {
            self.post_install_checks(env, candidate);
            info!("dependencies installed");
            return Ok(ValidationOutcome::pass("Dependencies installed successfully"));
        }
        Ok(self.classify_failure(candidate, report))
    }

    fn timeout_outcome(&self, report: InstallReport) -> ValidationOutcome {
        let timeout_secs = self.policy.install_timeout_secs;
        if self.policy.tolerate_timeout {
            warn!(timeout_secs, "install timed out, tolerated for this ecosystem");
            return ValidationOutcome::pass_with_warning(
                format!(
                    "Installation timed out after {timeout_secs}s; tolerated for large dependency graphs"
                ),
                FailureKind::Timeout,
            );
        }
        warn!(timeout_secs, "install timed out");
        ValidationOutcome::failure(
            FailureKind::Timeout,
            format!("Installation timed out after {timeout_secs}s"),
            report.output,
        )
        .with_error(RemediationError::InstallTimeout { timeout_secs })
    }

    /// Smoke import and consistency check. Logged only; never flips a pass.
    fn post_install_checks(&self, env: &InstallEnv, candidate: &PatchCandidate) {
        match self.installer.smoke_check(env, &candidate.package) {
            Ok(Some(report)) if !report.success => warn!(
                package = %candidate.package,
                output = %excerpt(&report.output),
                "smoke check failed"
            ),
            Ok(Some(_)) => debug!(package = %candidate.package, "smoke check passed"),
            Ok(None) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "smoke check could not run"),
        }
        match self.installer.check(env) {
            Ok(Some(report)) if !report.success => warn!(
                output = %excerpt(&report.output),
                "post-install consistency check reported problems"
            ),
            Ok(Some(_)) => debug!("post-install consistency check passed"),
            Ok(None) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "consistency check could not run"),
        }
    }

    fn classify_failure(&self, candidate: &PatchCandidate, report: InstallReport) -> ValidationOutcome {
        let message = format!("Dependency installation failed: {}", excerpt(&report.output));
        match self.classifier.classify(&report.output) {
            Classification::Conflict { packages } => {
                info!(packages = ?packages, "dependency conflict");
                let suggestions = self.rules.suggestions(candidate.ecosystem, &packages);
                ValidationOutcome::conflict(message, report.output, packages.clone())
                    .with_suggestions(suggestions)
                    .with_error(RemediationError::InstallConflict { packages })
            }
            Classification::BuildFailure {
                toolchain_mismatch: true,
            } => self.confirm_upstream(candidate, message, report),
            Classification::BuildFailure {
                toolchain_mismatch: false,
            } => {
                let error = RemediationError::InstallBuildFailure {
                    message: excerpt(&report.output),
                };
                ValidationOutcome::failure(FailureKind::BuildFailure, message, report.output)
                    .with_error(error)
            }
            Classification::Unrecognized => {
                ValidationOutcome::failure(FailureKind::Unrecognized, message, report.output)
            }
        }
    }

    /// A build failure caused by the host toolchain passes provisionally when
    /// the registry confirms the proposed version exists.
    fn confirm_upstream(
        &self,
        candidate: &PatchCandidate,
        message: String,
        report: InstallReport,
    ) -> ValidationOutcome {
        let (package, version) = (&candidate.package, &candidate.secure_version);
        match self
            .registry
            .version_exists(candidate.ecosystem, package, version)
        {
            Ok(true) => {
                warn!(%package, %version, "build failed on host toolchain; version confirmed upstream");
                ValidationOutcome::pass_with_warning(
                    format!(
                        "{package} {version} exists upstream; build failed only on this host toolchain"
                    ),
                    FailureKind::BuildFailure,
                )
            }
            Ok(false) => ValidationOutcome::failure(
                FailureKind::BuildFailure,
                format!("{message} ({package} {version} not found upstream)"),
                report.output,
            )
            .with_error(RemediationError::InstallBuildFailure {
                message: format!("{package} {version} not found upstream"),
            }),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "registry lookup failed");
                ValidationOutcome::failure(FailureKind::BuildFailure, message, report.output)
                    .with_error(RemediationError::InstallBuildFailure {
                        message: format!("could not confirm {package} {version} upstream"),
                    })
            }
        }
    }
}

impl<I: Installer, R: Registry, C: FailureClassifier> Validator for ValidationRunner<I, R, C> {
    #[instrument(skip_all, fields(package = %candidate.package, attempt = candidate.attempt))]
    fn validate(&self, candidate: &PatchCandidate) -> Result<ValidationOutcome> {
        let env = match InstallEnv::create(&self.policy.manifest_file, &candidate.proposed) {
            Ok(env) => env,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not create install environment");
                return Ok(ValidationOutcome::failure(
                    FailureKind::Environment,
                    format!("Could not create install environment: {err:#}"),
                    String::new(),
                ));
            }
        };
        let outcome = match self.validate_in(&env, candidate) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "installer could not run");
                ValidationOutcome::failure(
                    FailureKind::Environment,
                    format!("Installer could not run: {err:#}"),
                    String::new(),
                )
            }
        };
        env.close();
        Ok(outcome)
    }
}

fn excerpt(output: &str) -> String {
    output.trim().chars().take(MESSAGE_EXCERPT_CHARS).collect()
}
