//! depfix CLI.
//!
//! Patches a vulnerable dependency in its manifest, validates the candidate in
//! a disposable environment, and refines it until it installs or the attempt
//! budget is spent. The manifest on disk is never modified.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use depfix::coordinate::CoordinatorChain;
use depfix::core::patcher::{ManifestFormat, patch_manifest};
use depfix::core::types::{Ecosystem, SecureVersionTarget, VulnerabilityFinding};
use depfix::exit_codes;
use depfix::io::attempt_log::{write_attempt, write_session};
use depfix::io::batch::load_requests;
use depfix::io::config::{DEFAULT_CONFIG_FILE, DepfixConfig, load_config, write_config};
use depfix::io::manifest::{read_manifest, resolve_manifest_path};
use depfix::io::oracle::build_oracle;
use depfix::logging;
use depfix::remediate::{AttemptRecord, RemediationRequest, SessionConfig, SessionReport, run_session};
use depfix::validate::ValidationRunner;

#[derive(Parser)]
#[command(
    name = "depfix",
    version,
    about = "Verified remediation of vulnerable dependency declarations"
)]
struct Cli {
    /// Configuration file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct TargetArgs {
    /// Manifest file, absolute or relative to `--root`.
    #[arg(long)]
    manifest: PathBuf,
    /// Package ecosystem (pypi or npm).
    #[arg(long)]
    ecosystem: Ecosystem,
    /// Vulnerable package name.
    #[arg(long)]
    package: String,
    /// Currently declared version.
    #[arg(long = "from")]
    from: String,
    /// Secure version to move to.
    #[arg(long = "to")]
    to: String,
}

impl TargetArgs {
    fn target(&self) -> SecureVersionTarget {
        SecureVersionTarget {
            package: self.package.clone(),
            current_version: self.from.clone(),
            secure_version: self.to.clone(),
            ecosystem: self.ecosystem,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective compatibility rules.
    Rules {
        #[arg(long)]
        ecosystem: Option<Ecosystem>,
    },
    /// Print the single-package patch of a manifest without validating it.
    Patch {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Run the patch / validate / refine loop for one finding.
    Remediate {
        #[command(flatten)]
        target: TargetArgs,
        /// Advisory identifier used in reports.
        #[arg(long)]
        advisory: Option<String>,
        #[arg(long)]
        severity: Option<f64>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Write per-attempt artifacts and the session report here.
        #[arg(long)]
        report_dir: Option<PathBuf>,
        /// Override `max_attempts` from the config.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Remediate every request of a JSON batch file, one at a time.
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Rules { ecosystem } => cmd_rules(&cli.config, ecosystem),
        Command::Patch { target, root } => cmd_patch(&target, &root),
        Command::Remediate {
            target,
            advisory,
            severity,
            root,
            report_dir,
            max_attempts,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(max_attempts) = max_attempts {
                if max_attempts == 0 {
                    bail!("--max-attempts must be > 0");
                }
                config.max_attempts = max_attempts;
            }
            let request = RemediationRequest {
                finding: VulnerabilityFinding {
                    advisory_id: advisory
                        .unwrap_or_else(|| format!("{}-{}", target.package, target.from)),
                    package: target.package.clone(),
                    current_version: target.from.clone(),
                    ecosystem: target.ecosystem,
                    manifest_path: target.manifest.clone(),
                    severity,
                },
                target: target.target(),
            };
            let reports = remediate_all(&config, &root, report_dir.as_deref(), &[request])?;
            Ok(exit_codes::worst(reports.iter().map(|r| r.state)))
        }
        Command::Batch {
            input,
            root,
            report_dir,
        } => {
            let config = load_config(&cli.config)?;
            let requests = load_requests(&input)?;
            let reports = remediate_all(&config, &root, report_dir.as_deref(), &requests)?;
            Ok(exit_codes::worst(reports.iter().map(|r| r.state)))
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &DepfixConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_rules(config_path: &Path, ecosystem: Option<Ecosystem>) -> Result<i32> {
    let config = load_config(config_path)?;
    let rules = config.rule_set();
    for rule in rules.rules() {
        if ecosystem.is_some_and(|eco| eco != rule.ecosystem) {
            continue;
        }
        println!("[{}] {}", rule.ecosystem, rule);
    }
    Ok(exit_codes::OK)
}

fn cmd_patch(args: &TargetArgs, root: &Path) -> Result<i32> {
    let path = resolve_manifest_path(root, &args.manifest)?;
    let content = read_manifest(&path)?;
    let patched = patch_manifest(
        ManifestFormat::for_ecosystem(args.ecosystem),
        &content,
        &args.target(),
    )?;
    eprintln!("{}: {}", path.display(), patched.edit);
    print!("{}", patched.content);
    Ok(exit_codes::OK)
}

/// Process requests strictly one at a time.
fn remediate_all(
    config: &DepfixConfig,
    root: &Path,
    report_dir: Option<&Path>,
    requests: &[RemediationRequest],
) -> Result<Vec<SessionReport>> {
    let coordinator = CoordinatorChain::from_config(config, build_oracle(config)?);
    let session_config = SessionConfig::from(config);
    let mut reports = Vec::with_capacity(requests.len());
    for request in requests {
        let validator = ValidationRunner::from_config(config, request.target.ecosystem)?;
        let report = run_session(
            root,
            request,
            &validator,
            &coordinator,
            &session_config,
            print_attempt,
        )?;
        if let Some(dir) = report_dir {
            write_report(dir, &report)?;
        }
        print_summary(&report);
        reports.push(report);
    }
    Ok(reports)
}

fn write_report(dir: &Path, report: &SessionReport) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create report dir {}", dir.display()))?;
    for record in &report.attempts {
        write_attempt(dir, &report.advisory_id, record)?;
    }
    write_session(dir, report)?;
    Ok(())
}

fn print_attempt(record: &AttemptRecord) {
    let status = match (record.outcome.passed, record.outcome.warning) {
        (true, false) => "passed",
        (true, true) => "passed with warning",
        (false, _) => "failed",
    };
    eprintln!(
        "attempt {} ({}): {status}",
        record.candidate.attempt,
        record.candidate.provenance.as_str()
    );
}

fn print_summary(report: &SessionReport) {
    println!(
        "{} {}: {} after {} validation(s)",
        report.advisory_id,
        report.package,
        report.state.as_str(),
        report.validations
    );
    println!("  {}", report.reason);
    if let Some(handoff) = report.handoff() {
        for change in handoff.refinement_changes {
            println!("  refinement: {change}");
        }
    }
}
