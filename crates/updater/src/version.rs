//! Lenient version ordering.
//!
//! Release tags are not guaranteed to be valid semantic versions (`v5.2`,
//! `6.1.0-BETA`), so versions are compared segment by segment with missing or
//! non-numeric segments read as zero.

use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

/// Version reported when the installation carries no readable `package.json`.
pub const FALLBACK_VERSION: &str = "0.0.0";

/// Returns `true` if `candidate` is strictly newer than `current`.
///
/// Both operands are compared across the longer one's length, so `5.1` and
/// `5.1.0` are equal and neither is newer than the other.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

/// Orders two version strings using the lenient segment rules.
pub fn compare(left: &str, right: &str) -> Ordering {
    let left = segments(left);
    let right = segments(right);
    let len = left.len().max(right.len());

    for index in 0..len {
        let l = left.get(index).copied().unwrap_or(0);
        let r = right.get(index).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Removes a single leading `v` or `V` from a tag, e.g. `v5.2.0` -> `5.2.0`.
pub fn strip_prefix(version: &str) -> &str {
    let trimmed = version.trim();
    trimmed
        .strip_prefix(|c: char| c == 'v' || c == 'V')
        .unwrap_or(trimmed)
}

fn segments(version: &str) -> Vec<u64> {
    strip_prefix(version).split('.').map(parse_segment).collect()
}

fn parse_segment(segment: &str) -> u64 {
    let segment = segment.trim_start();
    let end = segment
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(segment.len());
    segment[..end].parse().unwrap_or(0)
}

/// `(major, minor, patch)` view of a version string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionTriple {
    /// Parse leniently; never fails.
    pub fn parse(version: &str) -> Self {
        let parts = segments(version);
        let at = |index: usize| parts.get(index).copied().unwrap_or(0);
        Self {
            major: at(0),
            minor: at(1),
            patch: at(2),
        }
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Deserialize)]
struct PackageManifest {
    version: Option<String>,
}

/// Reads the `version` field of `package.json` inside `dir`.
pub fn package_version(dir: &Path) -> Option<String> {
    let bytes = std::fs::read(dir.join("package.json")).ok()?;
    let manifest: PackageManifest = serde_json::from_slice(&bytes).ok()?;
    manifest.version.filter(|version| !version.trim().is_empty())
}

/// Version of the installation in `install_dir`, or [`FALLBACK_VERSION`].
pub fn installed_version(install_dir: &Path) -> String {
    package_version(install_dir).unwrap_or_else(|| FALLBACK_VERSION.to_string())
}
