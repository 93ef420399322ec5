//! Coordinated multi-package edits for refinement attempts.
//!
//! Every strategy recomputes its candidate from the original manifest; the
//! orchestrator never sees which strategy produced a candidate beyond its
//! [`Provenance`].

use tracing::{debug, info, warn};

use crate::core::feedback::FeedbackLog;
use crate::core::patcher::{self, ManifestFormat};
use crate::core::requirement::same_package;
use crate::core::rules::RuleSet;
use crate::core::types::{Ecosystem, Provenance, SecureVersionTarget, VersionEdit};
use crate::core::version::split_range_prefix;
use crate::error::RemediationError;
use crate::io::config::DepfixConfig;
use crate::io::oracle::{Oracle, strip_code_fences};
use crate::io::prompt::{PromptBuilder, RefinePromptInputs};

/// Everything a strategy may look at for one refinement attempt.
#[derive(Debug, Clone, Copy)]
pub struct CoordinationRequest<'a> {
    pub format: ManifestFormat,
    pub ecosystem: Ecosystem,
    pub manifest_file: &'a str,
    /// The true original manifest content.
    pub original: &'a str,
    pub target: &'a SecureVersionTarget,
    pub feedback: &'a FeedbackLog,
    /// Contents of every candidate that already failed validation.
    pub prior_failures: &'a [String],
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatedEdit {
    pub content: String,
    /// Declaration changes relative to the original, target first.
    pub edits: Vec<VersionEdit>,
    pub provenance: Provenance,
}

/// One way of producing a coordinated candidate.
///
/// `Ok(None)` means the strategy declines; `Err` is reserved for generation
/// errors that make further attempts pointless.
pub trait Coordinator {
    fn name(&self) -> &'static str;
    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError>;
}

impl<C: Coordinator + ?Sized> Coordinator for Box<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError> {
        (**self).coordinate(request)
    }
}

/// Deterministic path: single-package patch, then the rule table to a fixed point.
#[derive(Debug, Clone)]
pub struct RuleBased {
    rules: RuleSet,
}

impl RuleBased {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }
}

impl Coordinator for RuleBased {
    fn name(&self) -> &'static str {
        "rule-engine"
    }

    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError> {
        let patched = patcher::patch_manifest(request.format, request.original, request.target)?;
        let applied = self
            .rules
            .apply(request.format, request.ecosystem, &patched.content)?;
        if !applied.converged {
            warn!(
                attempt = request.attempt,
                "compatibility rules kept rewriting the manifest; using the last pass"
            );
        }
        debug!(
            changes = applied.changes.len(),
            attempt = request.attempt,
            "applied compatibility rules"
        );
        let edits = ordered_edits(
            request.format,
            request.original,
            &applied.content,
            &request.target.package,
        )?;
        Ok(Some(CoordinatedEdit {
            content: applied.content,
            edits,
            provenance: Provenance::RuleEngine,
        }))
    }
}

/// Open-ended path: ask the advisory oracle for a complete corrected manifest.
///
/// Oracle failures and implausible answers are logged and the strategy
/// declines, letting the next strategy run.
pub struct OracleBased<O: Oracle> {
    oracle: O,
    rules: RuleSet,
    prompts: PromptBuilder,
    min_response_bytes: usize,
}

impl<O: Oracle> OracleBased<O> {
    pub fn new(oracle: O, rules: RuleSet, prompts: PromptBuilder, min_response_bytes: usize) -> Self {
        Self {
            oracle,
            rules,
            prompts,
            min_response_bytes,
        }
    }

    fn accept(
        &self,
        request: &CoordinationRequest<'_>,
        response: &str,
    ) -> Result<String, String> {
        let mut text = strip_code_fences(response);
        if text.is_empty() {
            return Err("empty response".to_string());
        }
        let min_len = self.min_response_bytes.min(request.original.len() / 2);
        if text.len() < min_len {
            return Err(format!("response too short ({} < {min_len} bytes)", text.len()));
        }
        if request.original.ends_with('\n') && !text.ends_with('\n') {
            text.push('\n');
        }
        patcher::check_structure(request.format, &text).map_err(|err| err.to_string())?;
        let declared = patcher::declared_version(request.format, &text, &request.target.package)
            .map_err(|err| err.to_string())?;
        match declared {
            Some(version) if split_range_prefix(&version).1 == request.target.secure_version => {
                Ok(text)
            }
            Some(version) => Err(format!(
                "response declares {} at {version}, expected {}",
                request.target.package, request.target.secure_version
            )),
            None => Err(format!(
                "response does not declare {}",
                request.target.package
            )),
        }
    }
}

impl<O: Oracle> Coordinator for OracleBased<O> {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError> {
        if request.feedback.is_empty() {
            return Ok(None);
        }
        let inputs = RefinePromptInputs {
            ecosystem: request.ecosystem,
            manifest_file: request.manifest_file,
            target: request.target,
            manifest: request.original,
            attempt: request.attempt,
            rules: self.rules.describe(request.ecosystem),
            conflicting: request.feedback.conflicting_packages(),
            failure: request.feedback.render_latest(),
            history: request.feedback.render_history(),
        };
        let prompt = match self.prompts.build_refinement(&inputs) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to render oracle prompt");
                return Ok(None);
            }
        };
        let response = match self.oracle.complete(&prompt) {
            Ok(response) => response,
            Err(err) => {
                warn!(err = %err, attempt = request.attempt, "oracle unavailable, falling back");
                return Ok(None);
            }
        };
        let content = match self.accept(request, &response) {
            Ok(content) => content,
            Err(reason) => {
                warn!(reason = %reason, attempt = request.attempt, "rejected oracle response");
                return Ok(None);
            }
        };
        let edits = ordered_edits(
            request.format,
            request.original,
            &content,
            &request.target.package,
        )?;
        Ok(Some(CoordinatedEdit {
            content,
            edits,
            provenance: Provenance::Oracle,
        }))
    }
}

/// Strategies tried in order until one yields a manifest that differs from
/// the original and from every failed candidate.
#[derive(Default)]
pub struct CoordinatorChain {
    strategies: Vec<Box<dyn Coordinator>>,
}

impl CoordinatorChain {
    pub fn new(strategies: Vec<Box<dyn Coordinator>>) -> Self {
        Self { strategies }
    }

    /// Oracle first when one is configured, then the rule table.
    pub fn from_config(config: &DepfixConfig, oracle: Option<Box<dyn Oracle>>) -> Self {
        let rules = config.rule_set();
        let mut strategies: Vec<Box<dyn Coordinator>> = Vec::new();
        if let Some(oracle) = oracle {
            strategies.push(Box::new(OracleBased::new(
                oracle,
                rules.clone(),
                PromptBuilder::new(config.prompt_budget_bytes),
                config.oracle.min_response_bytes,
            )));
        }
        strategies.push(Box::new(RuleBased::new(rules)));
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Coordinator for CoordinatorChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError> {
        for strategy in &self.strategies {
            let Some(edit) = strategy.coordinate(request)? else {
                debug!(strategy = strategy.name(), "strategy declined");
                continue;
            };
            if edit.content == request.original
                || request.prior_failures.iter().any(|prior| *prior == edit.content)
            {
                debug!(
                    strategy = strategy.name(),
                    "strategy repeated a failed manifest"
                );
                continue;
            }
            info!(
                strategy = strategy.name(),
                attempt = request.attempt,
                edits = edit.edits.len(),
                "coordinated candidate ready"
            );
            return Ok(Some(edit));
        }
        Ok(None)
    }
}

fn ordered_edits(
    format: ManifestFormat,
    original: &str,
    proposed: &str,
    target: &str,
) -> Result<Vec<VersionEdit>, RemediationError> {
    let mut edits = patcher::diff_declarations(format, original, proposed)?;
    // Stable: target first, the rest in document order.
    edits.sort_by_key(|edit| !same_package(&edit.package, target));
    Ok(edits)
}
