//! End-to-end refinement sessions with scripted validators and coordinators.

use std::fs;

use depfix::coordinate::{
    CoordinatedEdit, CoordinationRequest, Coordinator, CoordinatorChain, OracleBased, RuleBased,
};
use depfix::core::classifier::PatternClassifier;
use depfix::core::patcher::{self, ManifestFormat, patch_manifest};
use depfix::core::rules::RuleSet;
use depfix::core::session::TerminalState;
use depfix::core::types::{Provenance, ValidationOutcome};
use depfix::error::RemediationError;
use depfix::io::config::DepfixConfig;
use depfix::io::prompt::PromptBuilder;
use depfix::remediate::{SessionConfig, run_session};
use depfix::test_support::{
    FLASK_PINNED, FLASK_SIMPLE, FakeRegistry, ScriptedCoordinator, ScriptedInstaller,
    ScriptedOracle, ScriptedStep, ScriptedValidator, flask_request, flask_target, write_manifest,
};
use depfix::validate::{ValidationPolicy, ValidationRunner};

fn rules_only() -> CoordinatorChain {
    CoordinatorChain::from_config(&DepfixConfig::default(), None)
}

fn conflict(message: &str, packages: &[&str]) -> ValidationOutcome {
    ValidationOutcome::conflict(
        message,
        format!("ERROR: ResolutionImpossible\n{message}"),
        packages.iter().map(ToString::to_string).collect(),
    )
}

#[test]
fn clean_single_package_upgrade_succeeds_on_first_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_SIMPLE);
    let validator =
        ScriptedValidator::new(vec![ValidationOutcome::pass("Dependencies installed successfully")]);

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &rules_only(),
        &SessionConfig::default(),
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Succeeded);
    assert_eq!(report.validations, 1);
    let last = report.last_attempt().expect("attempt");
    assert_eq!(last.candidate.proposed, "Flask==2.3.3\nrequests==2.25.0\n");
    assert_eq!(last.candidate.provenance, Provenance::SinglePackage);
    assert_eq!(report.handoff().expect("handoff").attempts, 1);
}

#[test]
fn conflict_is_resolved_by_rule_engine_on_second_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_PINNED);
    let validator = ScriptedValidator::new(vec![
        conflict(
            "Dependency installation failed: Werkzeug and MarkupSafe conflict",
            &["Werkzeug", "MarkupSafe"],
        ),
        ValidationOutcome::pass("Dependencies installed successfully"),
    ]);

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &rules_only(),
        &SessionConfig::default(),
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Succeeded);
    assert_eq!(report.validations, 2);
    let seen = validator.seen();
    assert_eq!(
        seen[1].proposed,
        "Flask==2.3.3\nrequests==2.25.0\nWerkzeug==2.3.3\nMarkupSafe==2.1.1\n"
    );
    assert_eq!(seen[1].provenance, Provenance::RuleEngine);
    let handoff = report.handoff().expect("handoff");
    let changed: Vec<&str> = handoff
        .refinement_changes
        .iter()
        .map(|edit| edit.package.as_str())
        .collect();
    assert_eq!(changed, vec!["Werkzeug", "MarkupSafe"]);
    assert_eq!(handoff.original, FLASK_PINNED);
}

#[test]
fn missing_target_package_aborts_before_validation() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", "requests==2.25.0\n");
    let validator = ScriptedValidator::new(Vec::new());

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &rules_only(),
        &SessionConfig::default(),
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Aborted);
    assert_eq!(report.validations, 0);
    assert!(report.attempts.is_empty());
    assert_eq!(
        report.error,
        Some(RemediationError::PackageLineNotFound {
            package: "Flask".to_string(),
            version: "2.0.1".to_string(),
        })
    );
    assert_eq!(report.reason, "could not find package Flask==2.0.1 in manifest");
    assert!(validator.seen().is_empty());
}

#[test]
fn tolerated_install_timeout_succeeds_with_warning() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_SIMPLE);
    let validator = ValidationRunner::new(
        ScriptedInstaller::new(ScriptedStep::Ok, ScriptedStep::TimedOut, ScriptedStep::Ok),
        FakeRegistry::new(true),
        PatternClassifier::pip(),
        RuleSet::builtin(),
        ValidationPolicy {
            manifest_file: "requirements.txt".to_string(),
            tolerate_timeout: true,
            install_timeout_secs: 120,
        },
    );

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &rules_only(),
        &SessionConfig::default(),
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Succeeded);
    let last = report.last_attempt().expect("attempt");
    assert!(last.outcome.passed && last.outcome.warning);
}

#[test]
fn unresolvable_conflicts_exhaust_the_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_PINNED);
    let validator = ScriptedValidator::new(vec![
        conflict("conflict on Werkzeug", &["Werkzeug"]),
        conflict("conflict on MarkupSafe", &["MarkupSafe"]),
        conflict("conflict on itsdangerous", &["itsdangerous"]),
    ]);
    let coordinator = ScriptedCoordinator::new(vec![
        Ok(Some(CoordinatedEdit {
            content: "Flask==2.3.3\nrequests==2.25.0\nWerkzeug==2.3.3\nMarkupSafe==2.0.0\n"
                .to_string(),
            edits: Vec::new(),
            provenance: Provenance::RuleEngine,
        })),
        Ok(Some(CoordinatedEdit {
            content: "Flask==2.3.3\nrequests==2.25.0\nWerkzeug==2.3.3\nMarkupSafe==2.1.1\n"
                .to_string(),
            edits: Vec::new(),
            provenance: Provenance::Oracle,
        })),
    ]);

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &coordinator,
        &SessionConfig { max_attempts: 3 },
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Exhausted);
    assert_eq!(report.validations, 3);
    assert_eq!(report.reason, "conflict on itsdangerous");
    assert!(report.handoff().is_none());
    assert_eq!(report.feedback.entries().len(), 3);
}

#[test]
fn retries_are_bounded_by_the_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_PINNED);
    let validator = ScriptedValidator::new(
        (0..10)
            .map(|i| conflict(&format!("conflict {i}"), &["Werkzeug"]))
            .collect(),
    );
    let coordinator = ScriptedCoordinator::new(
        (0..10)
            .map(|i| {
                Ok(Some(CoordinatedEdit {
                    content: format!("{FLASK_PINNED}# variant {i}\n"),
                    edits: Vec::new(),
                    provenance: Provenance::RuleEngine,
                }))
            })
            .collect(),
    );
    let mut observed = Vec::new();

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &coordinator,
        &SessionConfig { max_attempts: 2 },
        |record| observed.push(record.candidate.attempt),
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Exhausted);
    assert_eq!(observed, vec![1, 2]);
    assert_eq!(validator.seen().len(), 2);
    assert_eq!(coordinator.seen().len(), 1);
}

#[test]
fn non_retryable_failure_on_last_attempt_aborts() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_SIMPLE);
    let validator = ScriptedValidator::new(vec![ValidationOutcome::failure(
        depfix::core::types::FailureKind::BuildFailure,
        "Dependency installation failed: error: Failed building wheel for lxml",
        "error: Failed building wheel for lxml",
    )]);

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &rules_only(),
        &SessionConfig { max_attempts: 1 },
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Aborted);
    assert_eq!(
        report.reason,
        "Dependency installation failed: error: Failed building wheel for lxml"
    );
}

/// Bumps the patch segment of `requests` as declared in whatever manifest it
/// is given, so feeding it a previous candidate would bump twice.
struct BumpRequests;

impl Coordinator for BumpRequests {
    fn name(&self) -> &'static str {
        "bump-requests"
    }

    fn coordinate(
        &self,
        request: &CoordinationRequest<'_>,
    ) -> Result<Option<CoordinatedEdit>, RemediationError> {
        let patched = patch_manifest(request.format, request.original, request.target)?;
        let declared = patcher::declared_version(request.format, &patched.content, "requests")?
            .expect("requests declared");
        let (head, last) = declared.rsplit_once('.').expect("dotted version");
        let bumped = format!("{head}.{}", last.parse::<u32>().expect("numeric") + 1);
        let (content, _) =
            patcher::set_version(request.format, &patched.content, "requests", &bumped)?
                .expect("requests rewritten");
        Ok(Some(CoordinatedEdit {
            edits: patcher::diff_declarations(request.format, request.original, &content)?,
            content,
            provenance: Provenance::RuleEngine,
        }))
    }
}

#[test]
fn every_attempt_is_computed_from_the_original_manifest() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_SIMPLE);
    let validator = ScriptedValidator::new(vec![
        conflict("first", &["requests"]),
        conflict("second", &["requests"]),
        conflict("third", &["requests"]),
    ]);

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &BumpRequests,
        &SessionConfig { max_attempts: 3 },
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Exhausted);
    let seen = validator.seen();
    assert!(seen.iter().all(|candidate| candidate.original == FLASK_SIMPLE));
    assert_eq!(seen[1].proposed, "Flask==2.3.3\nrequests==2.25.1\n");
    assert_eq!(seen[2].proposed, "Flask==2.3.3\nrequests==2.25.1\n");
    assert_eq!(
        fs::read_to_string(temp.path().join("requirements.txt")).expect("read"),
        FLASK_SIMPLE
    );
}

#[test]
fn repeating_a_failed_manifest_means_no_further_coordination() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_SIMPLE);
    let validator = ScriptedValidator::new(vec![
        conflict("first", &["requests"]),
        conflict("second", &["requests"]),
    ]);
    let chain = CoordinatorChain::new(vec![Box::new(BumpRequests)]);

    let report = run_session(
        temp.path(),
        &flask_request("requirements.txt", "2.0.1", "2.3.3"),
        &validator,
        &chain,
        &SessionConfig { max_attempts: 5 },
        |_| {},
    )
    .expect("session");

    assert_eq!(report.state, TerminalState::Aborted);
    assert_eq!(report.validations, 2);
    assert_eq!(
        report.reason,
        "no further coordination possible; last failure: second"
    );
}

#[test]
fn oracle_candidate_is_preferred_and_unavailability_falls_back() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_manifest(temp.path(), "requirements.txt", FLASK_PINNED);
    let oracle_answer = "Flask==2.3.3\nrequests==2.31.0\nWerkzeug==2.3.7\nMarkupSafe==2.1.3\n";

    for (responses, expected) in [
        (vec![Ok(oracle_answer.to_string())], Provenance::Oracle),
        (
            vec![Err(RemediationError::OracleUnavailable {
                reason: "connection refused".to_string(),
            })],
            Provenance::RuleEngine,
        ),
    ] {
        let validator = ScriptedValidator::new(vec![
            conflict("werkzeug conflict", &["Werkzeug"]),
            ValidationOutcome::pass("Dependencies installed successfully"),
        ]);
        let chain = CoordinatorChain::new(vec![
            Box::new(OracleBased::new(
                ScriptedOracle::new(responses),
                RuleSet::builtin(),
                PromptBuilder::new(24_000),
                50,
            )),
            Box::new(RuleBased::new(RuleSet::builtin())),
        ]);

        let report = run_session(
            temp.path(),
            &flask_request("requirements.txt", "2.0.1", "2.3.3"),
            &validator,
            &chain,
            &SessionConfig::default(),
            |_| {},
        )
        .expect("session");

        assert_eq!(report.state, TerminalState::Succeeded);
        assert_eq!(validator.seen()[1].provenance, expected);
    }
}

#[test]
fn patching_is_exact_and_idempotent() {
    let manifest = "# web\n  Flask == 2.0.1  # pinned\n\nrequests>=2.25.0 ; python_version >= \"3.8\"\n";
    let target = flask_target("2.0.1", "2.3.3");
    let once = patch_manifest(ManifestFormat::Requirements, manifest, &target).expect("patch");
    assert_eq!(
        once.content,
        "# web\n  Flask == 2.3.3  # pinned\n\nrequests>=2.25.0 ; python_version >= \"3.8\"\n"
    );
    let twice =
        patch_manifest(ManifestFormat::Requirements, &once.content, &target).expect("patch");
    assert_eq!(twice.content, once.content);
}

#[test]
fn package_json_patching_is_idempotent_across_both_sections() {
    let manifest = "{\n  \"dependencies\": {\n    \"lodash\": \"^4.17.21\"\n  },\n  \"devDependencies\": {\n    \"lodash\": \"4.17.15\"\n  }\n}\n";
    let target = depfix::core::types::SecureVersionTarget {
        package: "lodash".to_string(),
        current_version: "4.17.15".to_string(),
        secure_version: "4.17.21".to_string(),
        ecosystem: depfix::core::types::Ecosystem::Npm,
    };
    let once = patch_manifest(ManifestFormat::PackageJson, manifest, &target).expect("patch");
    assert_eq!(
        once.content,
        "{\n  \"dependencies\": {\n    \"lodash\": \"^4.17.21\"\n  },\n  \"devDependencies\": {\n    \"lodash\": \"4.17.21\"\n  }\n}\n"
    );
    let twice = patch_manifest(ManifestFormat::PackageJson, &once.content, &target).expect("patch");
    assert_eq!(twice.content, once.content);
}

#[test]
fn rule_application_reaches_a_fixed_point() {
    let rules = RuleSet::builtin();
    let patched = patch_manifest(
        ManifestFormat::Requirements,
        FLASK_PINNED,
        &flask_target("2.0.1", "2.3.3"),
    )
    .expect("patch");
    let once = rules
        .apply(
            ManifestFormat::Requirements,
            depfix::core::types::Ecosystem::PyPi,
            &patched.content,
        )
        .expect("apply");
    let twice = rules
        .apply(
            ManifestFormat::Requirements,
            depfix::core::types::Ecosystem::PyPi,
            &once.content,
        )
        .expect("apply");
    assert_eq!(twice.content, once.content);
    assert!(twice.changes.is_empty());
}
