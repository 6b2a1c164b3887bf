//! Version and version requirement handling

use crate::{PackageError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use semver::{Version as SemverVersion, VersionReq as SemverVersionReq};

/// Wrapper around semver::Version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub SemverVersion);

/// Wrapper around semver::VersionReq that also keeps the text it was written as
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionReq {
    req: SemverVersionReq,
    source: String,
}

impl Version {
    /// Parse a version string
    pub fn parse(s: &str) -> Result<Self> {
        SemverVersion::parse(s.trim())
            .map(Version)
            .map_err(|_| PackageError::InvalidVersion {
                version: s.to_string(),
            })
    }

    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version(SemverVersion::new(major, minor, patch))
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }
}

impl VersionReq {
    /// Parse a version requirement string.
    ///
    /// Accepts semver comparators plus the npm-style forms the registry
    /// understands: bare versions are exact, `a - b` is an inclusive range and
    /// `latest` (or an empty string) matches anything.
    pub fn parse(s: &str) -> Result<Self> {
        let normalized = normalize_version_req(s);

        SemverVersionReq::parse(&normalized)
            .map(|req| VersionReq {
                req,
                source: s.trim().to_string(),
            })
            .map_err(|_| PackageError::InvalidVersion {
                version: s.to_string(),
            })
    }

    /// A requirement that matches any version
    pub fn any() -> Self {
        VersionReq {
            req: SemverVersionReq::STAR,
            source: "*".to_string(),
        }
    }

    /// A requirement that matches exactly one version
    pub fn exact(version: &Version) -> Self {
        let source = version.to_string();
        VersionReq {
            req: SemverVersionReq::parse(&format!("={}", source))
                .unwrap_or(SemverVersionReq::STAR),
            source,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(&version.0)
    }

    /// The requirement as originally written
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Normalize npm-style version requirements to semver format
fn normalize_version_req(s: &str) -> String {
    let trimmed = s.trim();

    if trimmed.is_empty() || trimmed == "latest" || trimmed == "*" {
        return "*".to_string();
    }

    if let Some((low, high)) = trimmed.split_once(" - ") {
        return format!(">={}, <={}", low.trim(), high.trim());
    }

    // Bare versions are exact, unlike semver's default caret
    if trimmed.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        return format!("={}", trimmed);
    }

    trimmed.to_string()
}

/// Pick the highest version satisfying `req`, preferring stable releases
pub fn highest_matching<'a, I>(versions: I, req: &VersionReq) -> Option<Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    let mut matching: Vec<&Version> = versions.into_iter().filter(|v| req.matches(v)).collect();
    matching.sort();

    matching
        .iter()
        .rev()
        .find(|v| !v.is_prerelease())
        .or_else(|| matching.last())
        .map(|v| (*v).clone())
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for VersionReq {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.source.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VersionReq {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        VersionReq::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl From<SemverVersion> for Version {
    fn from(v: SemverVersion) -> Self {
        Version(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_version_req_parsing() {
        let req = VersionReq::parse("^1.2.3").unwrap();
        assert!(req.matches(&v("1.2.4")));
        assert!(req.matches(&v("1.3.0")));
        assert!(!req.matches(&v("2.0.0")));
    }

    #[test]
    fn test_normalize_version_req() {
        assert_eq!(normalize_version_req("1.2.3"), "=1.2.3");
        assert_eq!(normalize_version_req("^1.2.3"), "^1.2.3");
        assert_eq!(normalize_version_req("latest"), "*");
        assert_eq!(normalize_version_req(""), "*");
        assert_eq!(normalize_version_req("1.0.0 - 2.0.0"), ">=1.0.0, <=2.0.0");
    }

    #[test]
    fn test_bare_version_is_exact() {
        let req = VersionReq::parse("1.0.0").unwrap();
        assert!(req.matches(&v("1.0.0")));
        assert!(!req.matches(&v("1.0.1")));
        assert_eq!(req.to_string(), "1.0.0");
    }

    #[test]
    fn test_highest_matching_prefers_stable() {
        let versions = vec![v("1.0.0"), v("1.2.0"), v("1.3.0-beta.1"), v("2.0.0")];

        let req = VersionReq::parse("^1.0.0").unwrap();
        assert_eq!(highest_matching(&versions, &req), Some(v("1.2.0")));

        let latest = VersionReq::parse("latest").unwrap();
        assert_eq!(highest_matching(&versions, &latest), Some(v("2.0.0")));

        let none = VersionReq::parse(">=3").unwrap();
        assert_eq!(highest_matching(&versions, &none), None);
    }

    #[test]
    fn test_only_prereleases_available() {
        let versions = vec![v("1.0.0-alpha"), v("1.0.0-beta")];
        let req = VersionReq::parse(">=1.0.0-alpha").unwrap();
        assert_eq!(highest_matching(&versions, &req), Some(v("1.0.0-beta")));
    }
}
