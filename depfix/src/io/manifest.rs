//! Locating and reading the manifest a finding points at.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::RemediationError;

/// Resolve a finding's manifest path against the repository root.
///
/// Absolute paths are used as-is. Relative paths are joined to `root`; when
/// that file does not exist, the bare file name at the root is tried.
pub fn resolve_manifest_path(root: &Path, manifest: &Path) -> Result<PathBuf, RemediationError> {
    if manifest.is_absolute() {
        return if manifest.is_file() {
            Ok(manifest.to_path_buf())
        } else {
            Err(RemediationError::ManifestNotFound {
                path: manifest.to_path_buf(),
            })
        };
    }
    let joined = root.join(manifest);
    if joined.is_file() {
        return Ok(joined);
    }
    if let Some(name) = manifest.file_name() {
        let fallback = root.join(name);
        if fallback.is_file() {
            debug!(
                requested = %manifest.display(),
                resolved = %fallback.display(),
                "manifest resolved by file name"
            );
            return Ok(fallback);
        }
    }
    Err(RemediationError::ManifestNotFound { path: joined })
}

/// Read manifest text. A missing file is `ManifestNotFound`; any other read
/// failure (permissions, invalid UTF-8) is reported as a malformed manifest.
pub fn read_manifest(path: &Path) -> Result<String, RemediationError> {
    fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => RemediationError::ManifestNotFound {
            path: path.to_path_buf(),
        },
        _ => RemediationError::MalformedManifest {
            reason: format!("read {}: {err}", path.display()),
        },
    })
}
