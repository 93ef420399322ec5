//! Batch input: a JSON array of `{finding, target}` records.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::remediate::RemediationRequest;

const REQUESTS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/remediation_requests.schema.json"
));

/// Load and validate batch requests (schema + per-request consistency).
pub fn load_requests(path: &Path) -> Result<Vec<RemediationRequest>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read requests {}", path.display()))?;
    parse_requests(&contents).with_context(|| format!("load requests {}", path.display()))
}

pub fn parse_requests(contents: &str) -> Result<Vec<RemediationRequest>> {
    let value: Value = serde_json::from_str(contents).context("parse requests json")?;
    validate_schema(&value)?;
    let requests: Vec<RemediationRequest> =
        serde_json::from_value(value).context("deserialize requests")?;
    for (idx, request) in requests.iter().enumerate() {
        request
            .validate()
            .map_err(|err| anyhow!("request {idx}: {err}"))?;
    }
    Ok(requests)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(REQUESTS_SCHEMA).context("parse requests schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(instance) {
        let messages = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "requests schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Ecosystem;

    const VALID: &str = r#"[
      {
        "finding": {
          "advisory_id": "CVE-2023-30861",
          "package": "Flask",
          "current_version": "2.0.1",
          "ecosystem": "PyPI",
          "manifest_path": "requirements.txt",
          "severity": 7.5
        },
        "target": {
          "package": "Flask",
          "current_version": "2.0.1",
          "secure_version": "2.3.3",
          "ecosystem": "PyPI"
        }
      }
    ]"#;

    #[test]
    fn parses_valid_requests() {
        let requests = parse_requests(VALID).expect("parse");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].finding.ecosystem, Ecosystem::PyPi);
        assert_eq!(requests[0].target.secure_version, "2.3.3");
    }

    #[test]
    fn rejects_schema_violations() {
        let missing_target = r#"[{"finding": {"advisory_id": "x", "package": "a",
            "current_version": "1", "ecosystem": "npm", "manifest_path": "package.json"}}]"#;
        let err = parse_requests(missing_target).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"), "{err:#}");

        let bad_ecosystem = VALID.replace("\"PyPI\"", "\"cargo\"");
        assert!(parse_requests(&bad_ecosystem).is_err());
    }

    #[test]
    fn rejects_target_for_other_package() {
        let mismatched = VALID.replacen("\"package\": \"Flask\"", "\"package\": \"Django\"", 1);
        let err = parse_requests(&mismatched).unwrap_err();
        assert!(format!("{err:#}").contains("request 0"), "{err:#}");
    }
}
