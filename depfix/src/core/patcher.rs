//! Single-package manifest patching.
//!
//! All functions are pure: they take manifest text and return new text. Nothing
//! outside the target declaration is rewritten for line-oriented manifests.

use serde_json::{Map, Value};

use crate::core::requirement;
use crate::core::types::{Ecosystem, SecureVersionTarget, VersionEdit};
use crate::core::version::split_range_prefix;
use crate::error::RemediationError;

/// Dependency sections of `package.json` searched in order.
const NPM_SECTIONS: [&str; 2] = ["dependencies", "devDependencies"];

/// Textual manifest grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// One requirement per line (`requirements.txt`).
    Requirements,
    /// JSON object with dependency maps (`package.json`).
    PackageJson,
}

impl ManifestFormat {
    pub fn for_ecosystem(ecosystem: Ecosystem) -> Self {
        match ecosystem {
            Ecosystem::PyPi => ManifestFormat::Requirements,
            Ecosystem::Npm => ManifestFormat::PackageJson,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub content: String,
    pub edit: VersionEdit,
}

/// Move exactly the target package to its secure version.
///
/// For requirement lines the line declaring the vulnerable version is preferred;
/// when the declared version differs, the first line naming the package is used.
pub fn patch_manifest(
    format: ManifestFormat,
    content: &str,
    target: &SecureVersionTarget,
) -> Result<Patched, RemediationError> {
    let not_found = || RemediationError::PackageLineNotFound {
        package: target.package.clone(),
        version: target.current_version.clone(),
    };
    match format {
        ManifestFormat::Requirements => requirement::replace_version(
            content,
            &target.package,
            Some(&target.current_version),
            &target.secure_version,
        )
        .or_else(|| {
            requirement::replace_version(content, &target.package, None, &target.secure_version)
        })
        .map(|(content, edit)| Patched { content, edit })
        .ok_or_else(not_found),
        ManifestFormat::PackageJson => {
            set_npm_version(content, &target.package, &target.secure_version)?
                .map(|(content, edit)| Patched { content, edit })
                .ok_or_else(not_found)
        }
    }
}

/// Version constraint currently declared for `package`, or `None` when absent.
///
/// Requirement manifests yield the bare version; `package.json` yields the raw
/// range value (`^4.17.1`).
pub fn declared_version(
    format: ManifestFormat,
    content: &str,
    package: &str,
) -> Result<Option<String>, RemediationError> {
    match format {
        ManifestFormat::Requirements => Ok(requirement::declared_version(content, package)),
        ManifestFormat::PackageJson => {
            let root = parse_package_json(content)?;
            Ok(npm_entries(&root)
                .find(|(name, _)| name.eq_ignore_ascii_case(package))
                .map(|(_, value)| value.to_string()))
        }
    }
}

/// Every versioned declaration in document order as `(name, constraint)`.
pub fn declarations(
    format: ManifestFormat,
    content: &str,
) -> Result<Vec<(String, String)>, RemediationError> {
    match format {
        ManifestFormat::Requirements => Ok(requirement::declarations(content)),
        ManifestFormat::PackageJson => {
            let root = parse_package_json(content)?;
            let mut out: Vec<(String, String)> = Vec::new();
            for (name, value) in npm_entries(&root) {
                if !out.iter().any(|(seen, _)| seen == name) {
                    out.push((name.to_string(), value.to_string()));
                }
            }
            Ok(out)
        }
    }
}

/// Set the version of an already-declared package. Returns `None` when the
/// package is not declared; callers never add new dependencies.
pub fn set_version(
    format: ManifestFormat,
    content: &str,
    package: &str,
    version: &str,
) -> Result<Option<(String, VersionEdit)>, RemediationError> {
    match format {
        ManifestFormat::Requirements => {
            Ok(requirement::replace_version(content, package, None, version))
        }
        ManifestFormat::PackageJson => set_npm_version(content, package, version),
    }
}

/// Declaration-level differences between two manifests of the same format.
///
/// Changed and added packages are reported; removed packages get an empty `new`.
pub fn diff_declarations(
    format: ManifestFormat,
    original: &str,
    proposed: &str,
) -> Result<Vec<VersionEdit>, RemediationError> {
    let before = declarations(format, original)?;
    let after = declarations(format, proposed)?;
    let mut edits = Vec::new();
    for (name, constraint) in &after {
        match before
            .iter()
            .find(|(old, _)| requirement::same_package(old, name))
        {
            Some((_, old)) if old == constraint => {}
            Some((_, old)) => edits.push(VersionEdit {
                package: name.clone(),
                old: old.clone(),
                new: constraint.clone(),
            }),
            None => edits.push(VersionEdit {
                package: name.clone(),
                old: String::new(),
                new: constraint.clone(),
            }),
        }
    }
    for (name, old) in &before {
        if !after
            .iter()
            .any(|(new, _)| requirement::same_package(new, name))
        {
            edits.push(VersionEdit {
                package: name.clone(),
                old: old.clone(),
                new: String::new(),
            });
        }
    }
    Ok(edits)
}

/// Reject text that cannot be a manifest of `format`.
pub fn check_structure(format: ManifestFormat, content: &str) -> Result<(), RemediationError> {
    match format {
        ManifestFormat::PackageJson => parse_package_json(content).map(|_| ()),
        ManifestFormat::Requirements => {
            if let Some(line) = content.lines().find(|l| l.trim_start().starts_with("```")) {
                return Err(RemediationError::MalformedManifest {
                    reason: format!("unexpected markup line: {}", line.trim()),
                });
            }
            if requirement::declarations(content).is_empty() {
                return Err(RemediationError::MalformedManifest {
                    reason: "no versioned requirements found".to_string(),
                });
            }
            Ok(())
        }
    }
}

fn parse_package_json(content: &str) -> Result<Map<String, Value>, RemediationError> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RemediationError::MalformedManifest {
            reason: "package.json root is not an object".to_string(),
        }),
        Err(err) => Err(RemediationError::MalformedManifest {
            reason: format!("invalid package.json: {err}"),
        }),
    }
}

fn npm_entries(root: &Map<String, Value>) -> impl Iterator<Item = (&str, &str)> {
    NPM_SECTIONS
        .iter()
        .filter_map(|section| root.get(*section).and_then(Value::as_object))
        .flat_map(|deps| {
            deps.iter()
                .filter_map(|(name, value)| value.as_str().map(|v| (name.as_str(), v)))
        })
}

/// Update every section declaring `package`, keeping each range prefix.
///
/// The reported edit is the first section whose value actually moved. When
/// every section already carries `version`, the input is returned untouched
/// with a no-op edit.
fn set_npm_version(
    content: &str,
    package: &str,
    version: &str,
) -> Result<Option<(String, VersionEdit)>, RemediationError> {
    let mut root = parse_package_json(content)?;
    let mut declared: Option<VersionEdit> = None;
    let mut changed: Option<VersionEdit> = None;
    for section in NPM_SECTIONS {
        let Some(deps) = root.get_mut(section).and_then(Value::as_object_mut) else {
            continue;
        };
        let Some((key, slot)) = deps
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(package))
        else {
            continue;
        };
        let Some(old) = slot.as_str().map(str::to_string) else {
            continue;
        };
        let (prefix, _) = split_range_prefix(&old);
        let new = format!("{prefix}{version}");
        let edit = VersionEdit {
            package: key.clone(),
            old,
            new: new.clone(),
        };
        if edit.old != edit.new {
            *slot = Value::String(new);
            changed.get_or_insert_with(|| edit.clone());
        }
        declared.get_or_insert(edit);
    }
    let Some(edit) = changed else {
        return Ok(declared.map(|edit| (content.to_string(), edit)));
    };
    let mut rendered = serde_json::to_string_pretty(&Value::Object(root)).map_err(|err| {
        RemediationError::MalformedManifest {
            reason: format!("render package.json: {err}"),
        }
    })?;
    rendered.push('\n');
    Ok(Some((rendered, edit)))
}
