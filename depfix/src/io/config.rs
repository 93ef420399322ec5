//! depfix configuration stored in `depfix.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::rules::{CompatibilityRule, RuleSet};
use crate::core::types::Ecosystem;

pub const DEFAULT_CONFIG_FILE: &str = "depfix.toml";

/// depfix configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DepfixConfig {
    /// Attempt budget per finding.
    pub max_attempts: u32,

    /// Truncate captured installer/oracle output beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Upper bound on the rendered oracle prompt.
    pub prompt_budget_bytes: usize,

    /// Include the built-in compatibility table before `rules`.
    pub builtin_rules: bool,

    /// Additional compatibility rules.
    pub rules: Vec<CompatibilityRule>,

    pub oracle: OracleConfig,
    pub registry: RegistryConfig,
    pub ecosystems: EcosystemProfiles,
}

impl Default for DepfixConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 24_000,
            builtin_rules: true,
            rules: Vec::new(),
            oracle: OracleConfig::default(),
            registry: RegistryConfig::default(),
            ecosystems: EcosystemProfiles::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    #[default]
    None,
    /// Pipe the prompt to a local command and read the answer from stdout.
    Command,
    /// OpenAI-compatible chat completions endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub kind: OracleKind,
    pub command: Vec<String>,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token for `http`.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Shortest response accepted as a manifest (capped at half the original length).
    pub min_response_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: OracleKind::None,
            command: Vec::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "DEPFIX_ORACLE_API_KEY".to_string(),
            timeout_secs: 60,
            temperature: 0.2,
            max_tokens: 2_000,
            min_response_bytes: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub pypi_url: String,
    pub npm_url: String,
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pypi_url: "https://pypi.org/pypi".to_string(),
            npm_url: "https://registry.npmjs.org".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcosystemProfiles {
    #[serde(default = "EcosystemProfile::pypi")]
    pub pypi: EcosystemProfile,
    #[serde(default = "EcosystemProfile::npm")]
    pub npm: EcosystemProfile,
}

impl Default for EcosystemProfiles {
    fn default() -> Self {
        Self {
            pypi: EcosystemProfile::pypi(),
            npm: EcosystemProfile::npm(),
        }
    }
}

/// How to install and check a manifest for one ecosystem.
///
/// Command vectors may use `{env}` (disposable environment directory),
/// `{manifest}` (materialized manifest path), `{package}` and `{module}`
/// (import name of the target package). A configured table replaces the
/// built-in profile; omitted fields fall back to empty commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EcosystemProfile {
    /// File name the candidate is materialized as.
    pub manifest_file: String,
    /// Prepares the environment (e.g. creates a virtualenv). Empty to skip.
    pub provision: Vec<String>,
    pub install: Vec<String>,
    /// Run after a successful install; failures are logged only. Empty to skip.
    pub smoke: Vec<String>,
    /// Post-install consistency check; failures are logged only. Empty to skip.
    pub check: Vec<String>,
    pub provision_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub smoke_timeout_secs: u64,
    /// Treat an install timeout as a pass with warning (large dependency graphs).
    pub tolerate_timeout: bool,
    /// Log fragments identifying a host toolchain that cannot build some packages.
    pub toolchain_signatures: Vec<String>,
}

impl Default for EcosystemProfile {
    fn default() -> Self {
        Self {
            manifest_file: String::new(),
            provision: Vec::new(),
            install: Vec::new(),
            smoke: Vec::new(),
            check: Vec::new(),
            provision_timeout_secs: 120,
            install_timeout_secs: 300,
            smoke_timeout_secs: 30,
            tolerate_timeout: false,
            toolchain_signatures: Vec::new(),
        }
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

impl EcosystemProfile {
    pub fn pypi() -> Self {
        Self {
            manifest_file: "requirements.txt".to_string(),
            provision: args(&["python3", "-m", "venv", "{env}/venv"]),
            install: args(&[
                "{env}/venv/bin/pip",
                "install",
                "--disable-pip-version-check",
                "--no-input",
                "--no-cache-dir",
                "-r",
                "{manifest}",
            ]),
            smoke: args(&["{env}/venv/bin/python", "-c", "import {module}"]),
            check: args(&["{env}/venv/bin/pip", "check"]),
            provision_timeout_secs: 120,
            install_timeout_secs: 180,
            smoke_timeout_secs: 30,
            tolerate_timeout: false,
            toolchain_signatures: args(&["Python 3.13", "requires a different Python"]),
        }
    }

    pub fn npm() -> Self {
        Self {
            manifest_file: "package.json".to_string(),
            provision: Vec::new(),
            install: args(&[
                "npm",
                "install",
                "--dry-run",
                "--prefer-offline",
                "--no-audit",
                "--no-fund",
            ]),
            smoke: Vec::new(),
            check: Vec::new(),
            provision_timeout_secs: 60,
            install_timeout_secs: 120,
            smoke_timeout_secs: 30,
            tolerate_timeout: true,
            toolchain_signatures: args(&["EBADENGINE", "Unsupported engine"]),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.manifest_file.trim().is_empty() {
            return Err(anyhow!("ecosystems.{name}.manifest_file must not be empty"));
        }
        if self.install.is_empty() || self.install[0].trim().is_empty() {
            return Err(anyhow!("ecosystems.{name}.install must be a non-empty array"));
        }
        if self.install_timeout_secs == 0 {
            return Err(anyhow!("ecosystems.{name}.install_timeout_secs must be > 0"));
        }
        if !self.provision.is_empty() && self.provision_timeout_secs == 0 {
            return Err(anyhow!("ecosystems.{name}.provision_timeout_secs must be > 0"));
        }
        if (!self.smoke.is_empty() || !self.check.is_empty()) && self.smoke_timeout_secs == 0 {
            return Err(anyhow!("ecosystems.{name}.smoke_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

impl DepfixConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        match self.oracle.kind {
            OracleKind::None => {}
            OracleKind::Command => {
                if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
                    return Err(anyhow!("oracle.command must be a non-empty array"));
                }
            }
            OracleKind::Http => {
                if self.oracle.base_url.trim().is_empty() || self.oracle.model.trim().is_empty() {
                    return Err(anyhow!("oracle.base_url and oracle.model are required for http"));
                }
            }
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            return Err(anyhow!("oracle.temperature must be within 0.0..=2.0"));
        }
        if self.registry.timeout_secs == 0 {
            return Err(anyhow!("registry.timeout_secs must be > 0"));
        }
        self.ecosystems.pypi.validate("pypi")?;
        self.ecosystems.npm.validate("npm")?;
        self.rule_set().validate().map_err(|e| anyhow!("rules: {e}"))?;
        Ok(())
    }

    pub fn profile(&self, ecosystem: Ecosystem) -> &EcosystemProfile {
        match ecosystem {
            Ecosystem::PyPi => &self.ecosystems.pypi,
            Ecosystem::Npm => &self.ecosystems.npm,
        }
    }

    /// Effective rule table: built-ins (when enabled) followed by configured rules.
    pub fn rule_set(&self) -> RuleSet {
        let mut rules = if self.builtin_rules {
            RuleSet::builtin()
        } else {
            RuleSet::default()
        };
        rules.extend(self.rules.iter().cloned());
        rules
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DepfixConfig::default()`.
pub fn load_config(path: &Path) -> Result<DepfixConfig> {
    if !path.exists() {
        let cfg = DepfixConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DepfixConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DepfixConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
