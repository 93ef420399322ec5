//! Append-only feedback accumulated across attempts of one session.

use serde::Serialize;

use crate::core::requirement::same_package;
use crate::core::types::{FailureKind, ValidationOutcome};

/// Diagnostics of one failed attempt, as fed into the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFeedback {
    pub attempt: u32,
    pub failure: Option<FailureKind>,
    pub message: String,
    pub conflicting_packages: Vec<String>,
    pub diagnostics: String,
    pub suggestions: Vec<String>,
}

impl AttemptFeedback {
    pub fn from_outcome(attempt: u32, outcome: &ValidationOutcome) -> Self {
        Self {
            attempt,
            failure: outcome.diagnostics.failure,
            message: outcome.message.clone(),
            conflicting_packages: outcome.diagnostics.conflicting_packages.clone(),
            diagnostics: outcome.diagnostics.feedback.clone(),
            suggestions: outcome.diagnostics.suggestions.clone(),
        }
    }

    fn render(&self) -> String {
        let mut out = format!("Attempt {}: {}\n", self.attempt, self.message);
        if !self.conflicting_packages.is_empty() {
            out.push_str(&format!(
                "Conflicting packages: {}\n",
                self.conflicting_packages.join(", ")
            ));
        }
        for suggestion in &self.suggestions {
            out.push_str(&format!("- {suggestion}\n"));
        }
        if !self.diagnostics.trim().is_empty() {
            out.push_str(self.diagnostics.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Entries are only ever appended; earlier attempts are never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FeedbackLog {
    entries: Vec<AttemptFeedback>,
}

impl FeedbackLog {
    pub fn push(&mut self, entry: AttemptFeedback) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AttemptFeedback] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&AttemptFeedback> {
        self.entries.last()
    }

    /// Earlier attempts, oldest first, excluding the latest.
    pub fn history(&self) -> &[AttemptFeedback] {
        match self.entries.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn render_latest(&self) -> String {
        self.latest().map(AttemptFeedback::render).unwrap_or_default()
    }

    pub fn render_history(&self) -> String {
        self.history()
            .iter()
            .map(AttemptFeedback::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Union of conflicting packages across all attempts, first-seen order.
    pub fn conflicting_packages(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in self.entries.iter().flat_map(|e| &e.conflicting_packages) {
            if !out.iter().any(|seen| same_package(seen, name)) {
                out.push(name.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(attempt: u32, packages: &[&str]) -> AttemptFeedback {
        let outcome = ValidationOutcome::conflict(
            "Dependency installation failed",
            format!("resolver log {attempt}"),
            packages.iter().map(ToString::to_string).collect(),
        );
        AttemptFeedback::from_outcome(attempt, &outcome)
    }

    #[test]
    fn history_excludes_latest() {
        let mut log = FeedbackLog::default();
        assert!(log.history().is_empty());
        log.push(conflict(1, &["flask", "werkzeug"]));
        log.push(conflict(2, &["werkzeug", "MarkupSafe"]));
        assert_eq!(log.history().len(), 1);
        assert_eq!(log.latest().map(|e| e.attempt), Some(2));
        assert!(log.render_latest().contains("resolver log 2"));
        assert!(!log.render_history().contains("resolver log 2"));
    }

    #[test]
    fn conflicting_packages_union_is_deduplicated() {
        let mut log = FeedbackLog::default();
        log.push(conflict(1, &["flask", "Werkzeug"]));
        log.push(conflict(2, &["werkzeug", "markupsafe"]));
        assert_eq!(
            log.conflicting_packages(),
            vec!["flask".to_string(), "Werkzeug".to_string(), "markupsafe".to_string()]
        );
    }
}
