//! Lightweight dotted-version helpers.
//!
//! Only what the compatibility rules need: prefix matching and ordering of
//! release-style versions. This is not a full PEP 440 / semver implementation.

use std::cmp::Ordering;

/// Split an npm-style range value into `(prefix, version)`, e.g. `^4.17.1` -> (`^`, `4.17.1`).
pub fn split_range_prefix(constraint: &str) -> (&str, &str) {
    let trimmed = constraint.trim();
    let idx = trimmed
        .find(|ch: char| ch.is_ascii_alphanumeric())
        .unwrap_or(trimmed.len());
    let (prefix, rest) = trimmed.split_at(idx);
    // `v1.2.3` is accepted by npm; keep the `v` out of the compared version.
    let rest = rest
        .strip_prefix('v')
        .filter(|r| r.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(rest);
    (prefix, rest)
}

/// True when `version` equals `prefix` or continues it at a segment boundary.
///
/// `2.3` and `2.3.` both match `2.3` and `2.3.3` but not `2.30.0`. An empty
/// prefix matches every version.
pub fn matches_prefix(version: &str, prefix: &str) -> bool {
    let prefix = prefix.trim().trim_end_matches('.');
    if prefix.is_empty() {
        return true;
    }
    let (_, version) = split_range_prefix(version);
    version == prefix
        || version
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Compare two dotted versions segment by segment.
///
/// Each segment orders by its leading number, then a bare number sorts after a
/// suffixed one (`1.0.0` > `1.0.0rc1`). Missing segments count as `0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (_, a) = split_range_prefix(a);
    let (_, b) = split_range_prefix(b);
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();
    for i in 0..left.len().max(right.len()) {
        let l = segment(left.get(i).copied().unwrap_or("0"));
        let r = segment(right.get(i).copied().unwrap_or("0"));
        let ord = l.0.cmp(&r.0).then_with(|| match (l.1.is_empty(), r.1.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => l.1.cmp(r.1),
        });
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn segment(raw: &str) -> (u64, &str) {
    let digits = raw.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(raw.len());
    let number = raw[..digits].parse().unwrap_or(0);
    (number, &raw[digits..])
}
