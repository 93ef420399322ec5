//! Per-attempt artifacts under `--report-dir`.
//!
//! Layout, one directory per finding:
//!
//! ```text
//! <report>/<advisory>/attempts/<n>/meta.json
//! <report>/<advisory>/attempts/<n>/candidate.txt
//! <report>/<advisory>/attempts/<n>/outcome.json
//! <report>/<advisory>/session.json
//! <report>/<advisory>/handoff.json     (succeeded sessions only)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{Provenance, VersionEdit};
use crate::remediate::{AttemptRecord, SessionReport};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta<'a> {
    pub advisory_id: &'a str,
    pub attempt: u32,
    pub provenance: Provenance,
    pub manifest_path: &'a Path,
    pub edits: &'a [VersionEdit],
    pub passed: bool,
    pub warning: bool,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub candidate_path: PathBuf,
    pub outcome_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(report_dir: &Path, advisory_id: &str, attempt: u32) -> Self {
        let dir = session_dir(report_dir, advisory_id)
            .join("attempts")
            .join(attempt.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            candidate_path: dir.join("candidate.txt"),
            outcome_path: dir.join("outcome.json"),
        }
    }
}

/// Directory holding every artifact of one finding.
pub fn session_dir(report_dir: &Path, advisory_id: &str) -> PathBuf {
    report_dir.join(sanitize(advisory_id))
}

pub fn write_attempt(report_dir: &Path, advisory_id: &str, record: &AttemptRecord) -> Result<AttemptPaths> {
    let candidate = &record.candidate;
    let paths = AttemptPaths::new(report_dir, advisory_id, candidate.attempt);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    let meta = AttemptMeta {
        advisory_id,
        attempt: candidate.attempt,
        provenance: candidate.provenance,
        manifest_path: &candidate.manifest_path,
        edits: &candidate.edits,
        passed: record.outcome.passed,
        warning: record.outcome.warning,
    };
    write_json(&paths.meta_path, &meta)?;
    write_text(&paths.candidate_path, &candidate.proposed)?;
    write_json(&paths.outcome_path, &record.outcome)?;
    Ok(paths)
}

/// Write `session.json`, plus `handoff.json` when the session succeeded.
pub fn write_session(report_dir: &Path, report: &SessionReport) -> Result<PathBuf> {
    let dir = session_dir(report_dir, &report.advisory_id);
    fs::create_dir_all(&dir).with_context(|| format!("create session dir {}", dir.display()))?;
    write_json(&dir.join("session.json"), report)?;
    if let Some(handoff) = report.handoff() {
        write_json(&dir.join("handoff.json"), &handoff)?;
    }
    Ok(dir)
}

fn sanitize(advisory_id: &str) -> String {
    let cleaned: String = advisory_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "finding".to_string()
    } else {
        cleaned
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PatchCandidate, ValidationOutcome};

    fn record(attempt: u32, outcome: ValidationOutcome) -> AttemptRecord {
        AttemptRecord {
            candidate: PatchCandidate {
                manifest_path: PathBuf::from("/repo/requirements.txt"),
                ecosystem: crate::core::types::Ecosystem::PyPi,
                package: "Flask".to_string(),
                secure_version: "2.3.3".to_string(),
                original: "Flask==2.0.1\n".to_string(),
                proposed: "Flask==2.3.3\n".to_string(),
                edits: vec![VersionEdit {
                    package: "Flask".to_string(),
                    old: "==2.0.1".to_string(),
                    new: "==2.3.3".to_string(),
                }],
                attempt,
                provenance: Provenance::SinglePackage,
            },
            outcome,
        }
    }

    #[test]
    fn attempt_paths_are_stable_and_sanitized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AttemptPaths::new(temp.path(), "GHSA/abc:1", 2);
        assert!(paths.dir.ends_with(Path::new("GHSA_abc_1/attempts/2")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.candidate_path.ends_with("candidate.txt"));
        assert!(paths.outcome_path.ends_with("outcome.json"));
        assert_eq!(sanitize("../.."), "_");
        assert_eq!(sanitize(""), "finding");
    }

    #[test]
    fn writes_attempt_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_attempt(
            temp.path(),
            "CVE-2023-30861",
            &record(1, ValidationOutcome::pass("Dependencies installed successfully")),
        )
        .expect("write");

        assert_eq!(
            fs::read_to_string(&paths.candidate_path).expect("candidate"),
            "Flask==2.3.3\n"
        );
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta")).expect("json");
        assert_eq!(meta["attempt"], 1);
        assert_eq!(meta["provenance"], "single-package");
        assert_eq!(meta["edits"][0]["new"], "==2.3.3");
        let outcome: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.outcome_path).expect("outcome"))
                .expect("json");
        assert_eq!(outcome["passed"], true);
    }
}
