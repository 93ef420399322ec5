//! Upstream registry lookups.
//!
//! Only used to confirm that a proposed version exists when an install failure
//! looks like a host toolchain problem.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, instrument};

use crate::core::types::Ecosystem;
use crate::io::config::RegistryConfig;

pub trait Registry {
    /// `Ok(false)` when the registry answers that the version does not exist.
    fn version_exists(&self, ecosystem: Ecosystem, package: &str, version: &str) -> Result<bool>;
}

/// JSON-API lookups against PyPI and the npm registry.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    pypi_url: String,
    npm_url: String,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("depfix/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build registry http client")?;
        Ok(Self {
            client,
            pypi_url: config.pypi_url.trim_end_matches('/').to_string(),
            npm_url: config.npm_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn version_url(&self, ecosystem: Ecosystem, package: &str, version: &str) -> String {
        match ecosystem {
            Ecosystem::PyPi => format!("{}/{package}/{version}/json", self.pypi_url),
            // Scoped names keep the `@` but encode the slash.
            Ecosystem::Npm => format!(
                "{}/{}/{version}",
                self.npm_url,
                package.replace('/', "%2F")
            ),
        }
    }
}

impl Registry for HttpRegistry {
    #[instrument(skip_all, fields(ecosystem = %ecosystem, package = package, version = version))]
    fn version_exists(&self, ecosystem: Ecosystem, package: &str, version: &str) -> Result<bool> {
        let url = self.version_url(ecosystem, package, version);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("query {url}"))?;
        let status = response.status();
        debug!(%url, status = status.as_u16(), "registry lookup");
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(anyhow!("registry returned {} for {url}", other.as_u16())),
        }
    }
}
