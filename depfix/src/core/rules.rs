//! Compatibility rule engine.
//!
//! A rule says: when `trigger` is declared at a version starting with
//! `trigger_prefix`, the listed packages must satisfy the listed constraints.
//! Rules only ever rewrite packages that are already declared.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::patcher::{self, ManifestFormat};
use crate::core::requirement::{normalize_name, same_package};
use crate::core::types::{Ecosystem, VersionEdit};
use crate::core::version::{compare_versions, matches_prefix, split_range_prefix};
use crate::error::RemediationError;

/// Upper bound on fixed-point passes; chains deeper than this are configuration errors.
const MAX_PASSES: usize = 8;

/// Version a rule requires of a co-dependency.
///
/// Written as `==X` (exact pin) or `>=X` (minimum) in configuration. A bare
/// version means an exact pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RequiredVersion {
    Exact(String),
    AtLeast(String),
}

impl RequiredVersion {
    pub fn version(&self) -> &str {
        match self {
            RequiredVersion::Exact(v) | RequiredVersion::AtLeast(v) => v,
        }
    }

    /// `Some(version)` when `current` must move, `None` when it already satisfies.
    fn update_for(&self, current: &str) -> Option<&str> {
        let (_, current) = split_range_prefix(current);
        match self {
            RequiredVersion::Exact(v) if current != v => Some(v),
            RequiredVersion::AtLeast(v) if compare_versions(current, v) == Ordering::Less => {
                Some(v)
            }
            _ => None,
        }
    }
}

impl TryFrom<String> for RequiredVersion {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let raw = raw.trim();
        let (exact, version) = if let Some(v) = raw.strip_prefix("==") {
            (true, v)
        } else if let Some(v) = raw.strip_prefix(">=") {
            (false, v)
        } else {
            (true, raw)
        };
        let version = version.trim();
        if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(format!(
                "invalid required version '{raw}' (expected ==X or >=X)"
            ));
        }
        Ok(if exact {
            RequiredVersion::Exact(version.to_string())
        } else {
            RequiredVersion::AtLeast(version.to_string())
        })
    }
}

impl From<RequiredVersion> for String {
    fn from(value: RequiredVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RequiredVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredVersion::Exact(v) => write!(f, "=={v}"),
            RequiredVersion::AtLeast(v) => write!(f, ">={v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRequirement {
    pub package: String,
    pub version: RequiredVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRule {
    pub ecosystem: Ecosystem,
    pub trigger: String,
    /// Version prefix of the trigger, matched on segment boundaries (`2.3` matches `2.3.3`).
    pub trigger_prefix: String,
    pub requires: Vec<RuleRequirement>,
}

impl CompatibilityRule {
    fn fires_for(&self, ecosystem: Ecosystem, declared: &str) -> bool {
        self.ecosystem == ecosystem && matches_prefix(declared, &self.trigger_prefix)
    }

    /// Whether one manifest can make both rules fire. Rules on the same trigger
    /// with disjoint prefixes never do, since a package declares one version.
    fn can_fire_with(&self, other: &CompatibilityRule) -> bool {
        self.ecosystem == other.ecosystem
            && (!same_package(&self.trigger, &other.trigger)
                || matches_prefix(&self.trigger_prefix, &other.trigger_prefix)
                || matches_prefix(&other.trigger_prefix, &self.trigger_prefix))
    }
}

impl fmt::Display for CompatibilityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requires: Vec<String> = self
            .requires
            .iter()
            .map(|req| format!("{} {}", req.package, req.version))
            .collect();
        let prefix = self.trigger_prefix.trim_end_matches('.');
        write!(f, "{} {}.x requires {}", self.trigger, prefix, requires.join(", "))
    }
}

/// Result of applying the rule set to a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleApplication {
    pub content: String,
    /// One entry per changed package: original constraint to final constraint.
    pub changes: Vec<VersionEdit>,
    /// False when the pass limit was reached while rules were still rewriting.
    pub converged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<CompatibilityRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<CompatibilityRule>) -> Self {
        Self { rules }
    }

    /// Known co-dependency constraints shipped with the tool.
    pub fn builtin() -> Self {
        fn rule(
            ecosystem: Ecosystem,
            trigger: &str,
            prefix: &str,
            requires: &[(&str, RequiredVersion)],
        ) -> CompatibilityRule {
            CompatibilityRule {
                ecosystem,
                trigger: trigger.to_string(),
                trigger_prefix: prefix.to_string(),
                requires: requires
                    .iter()
                    .map(|(package, version)| RuleRequirement {
                        package: package.to_string(),
                        version: version.clone(),
                    })
                    .collect(),
            }
        }
        let exact = |v: &str| RequiredVersion::Exact(v.to_string());
        let at_least = |v: &str| RequiredVersion::AtLeast(v.to_string());
        Self::new(vec![
            rule(
                Ecosystem::PyPi,
                "Flask",
                "2.3",
                &[("Werkzeug", exact("2.3.3")), ("Jinja2", at_least("3.1.2"))],
            ),
            rule(Ecosystem::PyPi, "Flask", "2.2", &[("Werkzeug", exact("2.2.3"))]),
            rule(Ecosystem::PyPi, "Werkzeug", "2.3", &[("MarkupSafe", at_least("2.1.1"))]),
            rule(Ecosystem::PyPi, "Werkzeug", "2.2", &[("MarkupSafe", at_least("2.1.1"))]),
            rule(Ecosystem::Npm, "react", "18.2", &[("react-dom", exact("18.2.0"))]),
        ])
    }

    pub fn rules(&self) -> &[CompatibilityRule] {
        &self.rules
    }

    /// Append rules after the current ones.
    pub fn extend(&mut self, rules: impl IntoIterator<Item = CompatibilityRule>) {
        self.rules.extend(rules);
    }

    /// Reject rules that can never be satisfied together: two rules that can
    /// fire on the same manifest and require the same package at an exact pin
    /// that differs from the other's pin or sits below the other's floor.
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.rules {
            if rule.trigger.trim().is_empty() {
                return Err("rule trigger must not be empty".to_string());
            }
            if rule.requires.is_empty() {
                return Err(format!("rule for {} requires nothing", rule.trigger));
            }
        }
        for (i, a) in self.rules.iter().enumerate() {
            for b in self.rules.iter().skip(i + 1) {
                if !a.can_fire_with(b) {
                    continue;
                }
                for req_a in &a.requires {
                    for req_b in b
                        .requires
                        .iter()
                        .filter(|req_b| same_package(&req_a.package, &req_b.package))
                    {
                        if !compatible(&req_a.version, &req_b.version) {
                            return Err(format!(
                                "conflicting requirements for {} ({} from {} {} vs {} from {} {})",
                                req_a.package,
                                req_a.version,
                                a.trigger,
                                a.trigger_prefix,
                                req_b.version,
                                b.trigger,
                                b.trigger_prefix
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Human-readable constraint lines for one ecosystem.
    pub fn describe(&self, ecosystem: Ecosystem) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.ecosystem == ecosystem)
            .map(ToString::to_string)
            .collect()
    }

    /// Constraint lines relevant to a set of conflicting packages.
    pub fn suggestions(&self, ecosystem: Ecosystem, packages: &[String]) -> Vec<String> {
        let involved = |name: &str| packages.iter().any(|p| same_package(p, name));
        self.rules
            .iter()
            .filter(|rule| rule.ecosystem == ecosystem)
            .filter(|rule| {
                involved(&rule.trigger) || rule.requires.iter().any(|req| involved(&req.package))
            })
            .map(|rule| format!("Consider: {rule}"))
            .collect()
    }

    /// Apply every matching rule until nothing changes.
    ///
    /// Packages the manifest does not declare are left alone. Changes are merged
    /// per package so a package rewritten twice reports one edit.
    pub fn apply(
        &self,
        format: ManifestFormat,
        ecosystem: Ecosystem,
        content: &str,
    ) -> Result<RuleApplication, RemediationError> {
        let mut current = content.to_string();
        let mut changes: Vec<VersionEdit> = Vec::new();
        let mut converged = false;
        for _ in 0..MAX_PASSES {
            let mut changed = false;
            for rule in &self.rules {
                let Some(declared) = patcher::declared_version(format, &current, &rule.trigger)?
                else {
                    continue;
                };
                if !rule.fires_for(ecosystem, &declared) {
                    continue;
                }
                for req in &rule.requires {
                    let Some(have) = patcher::declared_version(format, &current, &req.package)?
                    else {
                        continue;
                    };
                    let Some(want) = req.version.update_for(&have) else {
                        continue;
                    };
                    let Some((next, edit)) =
                        patcher::set_version(format, &current, &req.package, want)?
                    else {
                        continue;
                    };
                    if next == current {
                        continue;
                    }
                    merge_change(&mut changes, edit);
                    current = next;
                    changed = true;
                }
            }
            if !changed {
                converged = true;
                break;
            }
        }
        changes.retain(|edit| edit.old != edit.new);
        Ok(RuleApplication {
            content: current,
            changes,
            converged,
        })
    }
}

/// Whether one version can satisfy both requirements.
fn compatible(a: &RequiredVersion, b: &RequiredVersion) -> bool {
    use RequiredVersion::{AtLeast, Exact};
    match (a, b) {
        (Exact(x), Exact(y)) => x == y,
        (Exact(pin), AtLeast(floor)) | (AtLeast(floor), Exact(pin)) => {
            compare_versions(pin, floor) != Ordering::Less
        }
        (AtLeast(_), AtLeast(_)) => true,
    }
}

fn merge_change(changes: &mut Vec<VersionEdit>, edit: VersionEdit) {
    let key = normalize_name(&edit.package);
    match changes
        .iter_mut()
        .find(|existing| normalize_name(&existing.package) == key)
    {
        Some(existing) => existing.new = edit.new,
        None => changes.push(edit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_pypi(content: &str) -> RuleApplication {
        RuleSet::builtin()
            .apply(ManifestFormat::Requirements, Ecosystem::PyPi, content)
            .expect("apply")
    }

    #[test]
    fn flask_23_pulls_werkzeug_and_markupsafe_forward() {
        let applied = apply_pypi("flask==2.3.3\nwerkzeug==2.0.0\nmarkupsafe==2.0.1\n");
        assert_eq!(
            applied.content,
            "flask==2.3.3\nwerkzeug==2.3.3\nmarkupsafe==2.1.1\n"
        );
        let packages: Vec<&str> = applied.changes.iter().map(|c| c.package.as_str()).collect();
        assert_eq!(packages, vec!["werkzeug", "markupsafe"]);
    }

    #[test]
    fn never_adds_undeclared_packages() {
        let applied = apply_pypi("flask==2.3.3\nrequests==2.31.0\n");
        assert_eq!(applied.content, "flask==2.3.3\nrequests==2.31.0\n");
        assert!(applied.changes.is_empty());
    }

    #[test]
    fn at_least_leaves_newer_versions_alone() {
        let applied = apply_pypi("flask==2.3.3\nwerkzeug==2.3.3\njinja2==3.1.4\nmarkupsafe==2.1.5\n");
        assert!(applied.changes.is_empty());
    }

    #[test]
    fn flask_22_uses_its_own_werkzeug_pin() {
        let applied = apply_pypi("Flask==2.2.5\nWerkzeug==2.0.0\n");
        assert_eq!(applied.content, "Flask==2.2.5\nWerkzeug==2.2.3\n");
    }

    #[test]
    fn npm_rules_keep_range_prefix() {
        let content = "{\n  \"dependencies\": {\n    \"react\": \"^18.2.0\",\n    \"react-dom\": \"^17.0.2\"\n  }\n}\n";
        let applied = RuleSet::builtin()
            .apply(ManifestFormat::PackageJson, Ecosystem::Npm, content)
            .expect("apply");
        assert!(applied.content.contains("\"react-dom\": \"^18.2.0\""));
        assert_eq!(applied.changes[0].old, "^17.0.2");
    }

    #[test]
    fn rules_do_not_cross_ecosystems() {
        let applied = RuleSet::builtin()
            .apply(
                ManifestFormat::Requirements,
                Ecosystem::Npm,
                "flask==2.3.3\nwerkzeug==2.0.0\n",
            )
            .expect("apply");
        assert!(applied.changes.is_empty());
    }

    #[test]
    fn validate_rejects_conflicting_exact_pins() {
        let mut rules = RuleSet::builtin();
        assert!(rules.validate().is_ok());
        rules.extend([CompatibilityRule {
            ecosystem: Ecosystem::PyPi,
            trigger: "flask".to_string(),
            trigger_prefix: "2.3.3".to_string(),
            requires: vec![RuleRequirement {
                package: "werkzeug".to_string(),
                version: RequiredVersion::Exact("2.3.7".to_string()),
            }],
        }]);
        let err = rules.validate().unwrap_err();
        assert!(err.contains("conflicting requirements for Werkzeug"), "{err}");
    }

    fn werkzeug_floor(trigger: &str, floor: &str) -> CompatibilityRule {
        CompatibilityRule {
            ecosystem: Ecosystem::PyPi,
            trigger: trigger.to_string(),
            trigger_prefix: "1".to_string(),
            requires: vec![RuleRequirement {
                package: "Werkzeug".to_string(),
                version: RequiredVersion::AtLeast(floor.to_string()),
            }],
        }
    }

    #[test]
    fn validate_rejects_exact_pin_below_another_rules_floor() {
        let mut rules = RuleSet::builtin();
        rules.extend([werkzeug_floor("gunicorn", "3.0")]);
        let err = rules.validate().unwrap_err();
        assert!(err.contains("==2.3.3 from Flask 2.3 vs >=3.0 from gunicorn 1"), "{err}");

        let mut rules = RuleSet::builtin();
        rules.extend([werkzeug_floor("gunicorn", "2.2.0")]);
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn unvalidated_flapping_rules_report_no_convergence() {
        let mut rules = RuleSet::builtin();
        rules.extend([werkzeug_floor("gunicorn", "3.0")]);
        let applied = rules
            .apply(
                ManifestFormat::Requirements,
                Ecosystem::PyPi,
                "flask==2.3.3\ngunicorn==1.0\nwerkzeug==2.0.0\n",
            )
            .expect("apply");
        assert!(!applied.converged);
        assert!(apply_pypi("flask==2.3.3\nwerkzeug==2.0.0\n").converged);
    }

    #[test]
    fn required_version_parses_from_config_strings() {
        assert_eq!(
            RequiredVersion::try_from("==2.3.3".to_string()),
            Ok(RequiredVersion::Exact("2.3.3".to_string()))
        );
        assert_eq!(
            RequiredVersion::try_from(">= 2.1.1".to_string()),
            Ok(RequiredVersion::AtLeast("2.1.1".to_string()))
        );
        assert!(RequiredVersion::try_from("~=1.0".to_string()).is_err());
    }

    #[test]
    fn describe_and_suggest_render_rules() {
        let rules = RuleSet::builtin();
        let lines = rules.describe(Ecosystem::PyPi);
        assert_eq!(lines[0], "Flask 2.3.x requires Werkzeug ==2.3.3, Jinja2 >=3.1.2");
        let suggestions = rules.suggestions(Ecosystem::PyPi, &["markupsafe".to_string()]);
        assert_eq!(suggestions.len(), 2);
    }
}
