//! Line-oriented requirement parsing (`requirements.txt` style).
//!
//! Parsing never allocates a new representation of the line: callers get byte
//! spans into the original text so rewrites touch only the version token.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::VersionEdit;

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[[^\]]*\])?\s*(?P<op>===|==|~=|>=|<=|!=|>|<)\s*(?P<version>[^\s,;#]+)",
    )
    .unwrap()
});

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-_.]+").unwrap());

/// A pinned or bounded requirement parsed from a single manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementLine<'a> {
    pub name: &'a str,
    pub operator: &'a str,
    pub version: &'a str,
    /// Byte range of `version` within the line.
    pub version_span: Range<usize>,
}

impl RequirementLine<'_> {
    pub fn constraint(&self) -> String {
        format!("{}{}", self.operator, self.version)
    }
}

/// Parse a line (without its newline). Blank lines, comments, option lines
/// (`-r`, `-e`), URLs and unversioned names yield `None`.
pub fn parse_line(line: &str) -> Option<RequirementLine<'_>> {
    if is_comment_or_blank(line) {
        return None;
    }
    let caps = REQUIREMENT_RE.captures(line)?;
    let name = caps.name("name")?;
    let op = caps.name("op")?;
    let version = caps.name("version")?;
    Some(RequirementLine {
        name: name.as_str(),
        operator: op.as_str(),
        version: version.as_str(),
        version_span: version.range(),
    })
}

pub fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Normalized package name: case-folded, runs of `-`, `_`, `.` collapsed to `-`.
pub fn normalize_name(name: &str) -> String {
    SEPARATOR_RE
        .replace_all(&name.trim().to_ascii_lowercase(), "-")
        .into_owned()
}

pub fn same_package(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}

/// All versioned declarations in document order as `(name, constraint)`.
pub fn declarations(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(parse_line)
        .map(|req| (req.name.to_string(), req.constraint()))
        .collect()
}

/// Version currently declared for `package` (first matching line).
pub fn declared_version(content: &str, package: &str) -> Option<String> {
    content
        .lines()
        .filter_map(parse_line)
        .find(|req| same_package(req.name, package))
        .map(|req| req.version.to_string())
}

/// Rewrite the version token of the first line declaring `package`.
///
/// With `expected` set, only a line whose version equals it matches. Every other
/// byte of the content (operator, indentation, extras, markers, inline comments,
/// line endings, final newline) is preserved.
pub fn replace_version(
    content: &str,
    package: &str,
    expected: Option<&str>,
    new_version: &str,
) -> Option<(String, VersionEdit)> {
    let mut offset = 0usize;
    for raw in content.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        if let Some(req) = parse_line(line)
            && same_package(req.name, package)
            && expected.is_none_or(|want| req.version == want)
        {
            let start = offset + req.version_span.start;
            let end = offset + req.version_span.end;
            let mut out = String::with_capacity(content.len() + new_version.len());
            out.push_str(&content[..start]);
            out.push_str(new_version);
            out.push_str(&content[end..]);
            let edit = VersionEdit {
                package: req.name.to_string(),
                old: req.constraint(),
                new: format!("{}{}", req.operator, new_version),
            };
            return Some((out, edit));
        }
        offset += raw.len();
    }
    None
}
