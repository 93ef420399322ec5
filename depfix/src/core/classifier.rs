//! Deterministic classification of installer diagnostics.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::requirement::normalize_name;
use crate::core::types::Ecosystem;

/// What a failed install log says went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The resolver could not satisfy the declared constraints together.
    Conflict { packages: Vec<String> },
    /// A package failed to build. `toolchain_mismatch` is set when the log names
    /// a known host toolchain incompatibility rather than a manifest problem.
    BuildFailure { toolchain_mismatch: bool },
    Unrecognized,
}

/// Seam for installer-specific log parsing.
pub trait FailureClassifier {
    fn classify(&self, log: &str) -> Classification;
}

static PIP_EXTRACTORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)cannot install ([^\n]+?) because",
        r"(?m)The user requested ([A-Za-z0-9][A-Za-z0-9._-]*)",
        r"(?m)^\s*([A-Za-z0-9][A-Za-z0-9._-]*) \S+ depends on ([A-Za-z0-9][A-Za-z0-9._-]*)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static NPM_EXTRACTORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)Found: (@?[A-Za-z0-9][A-Za-z0-9._/-]*)@",
        r"(?m)peer (@?[A-Za-z0-9][A-Za-z0-9._/-]*)@",
        r"(?m)from (@?[A-Za-z0-9][A-Za-z0-9._/-]*)@",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\s,]+").unwrap());

/// Leading package name of a token such as `flask==2.3.3`; version-only tokens never match.
static LEADING_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@?[A-Za-z](?:[A-Za-z0-9._/-]*[A-Za-z0-9])?").unwrap());

/// Substring-driven classifier configured per installer.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    conflict_markers: Vec<String>,
    build_markers: Vec<String>,
    toolchain_signatures: Vec<String>,
    extractors: &'static [Regex],
}

impl PatternClassifier {
    pub fn pip() -> Self {
        Self {
            conflict_markers: strings(&[
                "conflicting dependencies",
                "because these package versions",
                "ResolutionImpossible",
            ]),
            build_markers: strings(&[
                "build wheel",
                "subprocess-exited-with-error",
                "Failed building wheel",
                "legacy-install-failure",
            ]),
            toolchain_signatures: Vec::new(),
            extractors: &PIP_EXTRACTORS,
        }
    }

    pub fn npm() -> Self {
        Self {
            conflict_markers: strings(&[
                "ERESOLVE",
                "Conflicting peer dependency",
                "unable to resolve dependency tree",
            ]),
            build_markers: strings(&["gyp ERR!", "npm ERR! code ELIFECYCLE", "install script"]),
            toolchain_signatures: Vec::new(),
            extractors: &NPM_EXTRACTORS,
        }
    }

    pub fn for_ecosystem(ecosystem: Ecosystem) -> Self {
        match ecosystem {
            Ecosystem::PyPi => Self::pip(),
            Ecosystem::Npm => Self::npm(),
        }
    }

    /// Log fragments identifying a host toolchain that cannot build some packages.
    pub fn with_toolchain_signatures(mut self, signatures: &[String]) -> Self {
        self.toolchain_signatures.extend(signatures.iter().cloned());
        self
    }

    /// Package names mentioned by conflict diagnostics, deduplicated in first-seen order.
    pub fn conflicting_packages(&self, log: &str) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();
        for re in self.extractors {
            for caps in re.captures_iter(log) {
                for group in caps.iter().skip(1).flatten() {
                    for token in TOKEN_RE.find_iter(group.as_str()) {
                        let Some(name) = LEADING_NAME_RE.find(token.as_str()) else {
                            continue;
                        };
                        if name.as_str().eq_ignore_ascii_case("and") {
                            continue;
                        }
                        found.push((group.start() + token.start(), name.as_str().to_string()));
                    }
                }
            }
        }
        found.sort_by_key(|(pos, _)| *pos);
        let mut out: Vec<String> = Vec::new();
        for (_, name) in found {
            if !out
                .iter()
                .any(|seen| normalize_name(seen) == normalize_name(&name))
            {
                out.push(name);
            }
        }
        out
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, log: &str) -> Classification {
        if contains_any(log, &self.conflict_markers) {
            return Classification::Conflict {
                packages: self.conflicting_packages(log),
            };
        }
        if contains_any(log, &self.build_markers) {
            return Classification::BuildFailure {
                toolchain_mismatch: contains_any(log, &self.toolchain_signatures),
            };
        }
        Classification::Unrecognized
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let lowered = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| !needle.is_empty() && lowered.contains(&needle.to_lowercase()))
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIP_CONFLICT: &str = "\
ERROR: Cannot install flask==2.3.3 and werkzeug==2.0.0 because these package versions have conflicting dependencies.

The conflict is caused by:
    The user requested werkzeug==2.0.0
    flask 2.3.3 depends on Werkzeug>=2.3.3
";

    #[test]
    fn pip_conflict_extracts_packages_in_order() {
        let classification = PatternClassifier::pip().classify(PIP_CONFLICT);
        assert_eq!(
            classification,
            Classification::Conflict {
                packages: vec!["flask".to_string(), "werkzeug".to_string()],
            }
        );
    }

    #[test]
    fn npm_eresolve_is_conflict() {
        let log = "\
npm ERR! code ERESOLVE
npm ERR! ERESOLVE unable to resolve dependency tree
npm ERR! Found: react@18.2.0
npm ERR! Could not resolve dependency:
npm ERR! peer react@\"^17.0.0\" from react-dom@17.0.2
";
        let Classification::Conflict { packages } = PatternClassifier::npm().classify(log) else {
            panic!("expected conflict");
        };
        assert_eq!(packages, vec!["react".to_string(), "react-dom".to_string()]);
    }

    #[test]
    fn build_failure_detects_toolchain_signature() {
        let log = "error: subprocess-exited-with-error\n  Building for Python 3.13 is not supported\n";
        let classifier =
            PatternClassifier::pip().with_toolchain_signatures(&["Python 3.13".to_string()]);
        assert_eq!(
            classifier.classify(log),
            Classification::BuildFailure {
                toolchain_mismatch: true
            }
        );
        assert_eq!(
            PatternClassifier::pip().classify(log),
            Classification::BuildFailure {
                toolchain_mismatch: false
            }
        );
    }

    #[test]
    fn unknown_failure_is_unrecognized() {
        let log = "ERROR: Could not open requirements file: [Errno 2]";
        assert_eq!(PatternClassifier::pip().classify(log), Classification::Unrecognized);
    }
}
