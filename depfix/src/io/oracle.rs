//! Advisory oracle adapters.
//!
//! Every call is a single, self-contained request: the prompt carries all the
//! context for that attempt and no conversation history is retained between
//! calls. Any failure is reported as [`RemediationError::OracleUnavailable`].

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::error::RemediationError;
use crate::io::config::{DepfixConfig, OracleConfig, OracleKind};
use crate::io::process::run_command_with_timeout;

pub const SYSTEM_PROMPT: &str = "You resolve dependency version conflicts. \
Reply with the complete corrected manifest file and nothing else.";

pub trait Oracle {
    fn complete(&self, prompt: &str) -> Result<String, RemediationError>;
}

impl<O: Oracle + ?Sized> Oracle for Box<O> {
    fn complete(&self, prompt: &str) -> Result<String, RemediationError> {
        (**self).complete(prompt)
    }
}

impl<O: Oracle + ?Sized> Oracle for &O {
    fn complete(&self, prompt: &str) -> Result<String, RemediationError> {
        (**self).complete(prompt)
    }
}

fn unavailable(reason: impl Into<String>) -> RemediationError {
    RemediationError::OracleUnavailable {
        reason: reason.into(),
    }
}

/// Pipes the prompt to a local command and reads the answer from stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, prompt: &str) -> Result<String, RemediationError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| unavailable("oracle command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| unavailable(format!("{err:#}")))?;
        if output.timed_out {
            return Err(unavailable(format!(
                "oracle command timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            return Err(unavailable(format!(
                "oracle command exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(bytes = output.stdout.len(), "oracle command answered");
        Ok(output.stdout_text())
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `POST <base_url>/chat/completions` with one system and
/// one user message.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
}

impl HttpOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build oracle http client")?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        if api_key.is_none() {
            debug!(env = %config.api_key_env, "no oracle api key set, sending unauthenticated requests");
        }
        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl Oracle for HttpOracle {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, prompt: &str) -> Result<String, RemediationError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|err| unavailable(format!("http request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(unavailable(format!(
                "oracle returned {}: {}",
                status.as_u16(),
                body.chars().take(300).collect::<String>()
            )));
        }
        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|err| unavailable(format!("invalid chat response: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| unavailable("missing choices[0].message.content"))
    }
}

/// Build the configured oracle, or `None` when `oracle.kind = "none"`.
pub fn build_oracle(config: &DepfixConfig) -> Result<Option<Box<dyn Oracle>>> {
    let oracle = &config.oracle;
    let built: Box<dyn Oracle> = match oracle.kind {
        OracleKind::None => return Ok(None),
        OracleKind::Command => Box::new(CommandOracle::new(
            oracle.command.clone(),
            Duration::from_secs(oracle.timeout_secs),
            config.output_limit_bytes,
        )),
        OracleKind::Http => Box::new(HttpOracle::new(oracle)?),
    };
    Ok(Some(built))
}

/// Extract manifest text from a response that may wrap it in markdown fences.
///
/// The body of the first fenced block is returned when one exists; otherwise
/// the trimmed response.
pub fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    // Skip the info string (```txt, ```json).
    let body_start = after_open.find('\n').map_or(after_open.len(), |i| i + 1);
    let body = &after_open[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => {
            warn!("oracle response has an unterminated code fence");
            body
        }
    };
    body.trim_matches('\n').trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_info_string() {
        let response = "Here you go:\n```txt\nflask==2.3.3\nwerkzeug==2.3.3\n```\nGood luck";
        assert_eq!(strip_code_fences(response), "flask==2.3.3\nwerkzeug==2.3.3");
        assert_eq!(strip_code_fences("  flask==2.3.3\n\n"), "flask==2.3.3");
        assert_eq!(strip_code_fences("```\n{}\n"), "{}");
    }

    #[test]
    fn command_oracle_reads_stdout_and_maps_failures() {
        let echo = CommandOracle::new(
            vec!["sh".to_string(), "-c".to_string(), "cat".to_string()],
            Duration::from_secs(10),
            10_000,
        );
        assert_eq!(echo.complete("flask==2.3.3\n").expect("answer"), "flask==2.3.3\n");

        let failing = CommandOracle::new(
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 2".to_string()],
            Duration::from_secs(10),
            10_000,
        );
        let err = failing.complete("prompt").unwrap_err();
        assert!(matches!(err, RemediationError::OracleUnavailable { .. }));
        assert!(!err.is_generation_error());
    }

    #[test]
    fn build_oracle_respects_kind() {
        let config = DepfixConfig::default();
        assert!(build_oracle(&config).expect("build").is_none());
        let config = DepfixConfig {
            oracle: OracleConfig {
                kind: OracleKind::Command,
                command: vec!["cat".to_string()],
                ..OracleConfig::default()
            },
            ..DepfixConfig::default()
        };
        assert!(build_oracle(&config).expect("build").is_some());
    }
}
