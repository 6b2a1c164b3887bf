//! Package references: what the user (or a dependency entry) asks to install

use crate::manifest::{is_path_like, is_valid_package_name};
use crate::{PackageError, Result, VersionReq};
use std::fmt;
use std::path::{Path, PathBuf};

/// File suffixes recognized as distribution archives
pub const ARCHIVE_SUFFIXES: [&str; 2] = [".tar.gz", ".tgz"];

/// Where a package comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageReference {
    /// A package directory containing a manifest
    Directory(PathBuf),
    /// A distribution archive on disk
    Archive(PathBuf),
    /// A package name looked up in the registry
    Registry { name: String, req: VersionReq },
}

impl PackageReference {
    /// Classify a command-line reference.
    ///
    /// Existing directories and archive files win over registry names, so a
    /// local `./foo` is never sent to the registry.
    pub fn classify(reference: &str) -> Result<Self> {
        let path = Path::new(reference);
        if path.is_dir() {
            return Ok(PackageReference::Directory(path.to_path_buf()));
        }
        if path.is_file() {
            if has_archive_suffix(reference) {
                return Ok(PackageReference::Archive(path.to_path_buf()));
            }
            return Err(PackageError::InvalidReference {
                reference: reference.to_string(),
                message: "file is not a .tar.gz archive".to_string(),
            });
        }
        if is_path_like(reference) || has_archive_suffix(reference) {
            return Err(PackageError::PackageNotFound {
                name: reference.to_string(),
                version: "*".to_string(),
            });
        }

        let (name, req) = parse_refstring(reference)?;
        Ok(PackageReference::Registry { name, req })
    }

    /// Classify a manifest dependency entry.
    ///
    /// Path-like values are taken relative to the depending package's
    /// directory; everything else is a registry requirement.
    pub fn for_dependency(name: &str, value: &str, base_dir: &Path) -> Result<Self> {
        if is_path_like(value) {
            let raw = value.trim().trim_start_matches("file:");
            let path = base_dir.join(raw);
            if has_archive_suffix(raw) {
                return Ok(PackageReference::Archive(path));
            }
            return Ok(PackageReference::Directory(path));
        }

        Ok(PackageReference::Registry {
            name: name.to_string(),
            req: VersionReq::parse(value)?,
        })
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            PackageReference::Directory(_) => SourceKind::Directory,
            PackageReference::Archive(_) => SourceKind::Archive,
            PackageReference::Registry { .. } => SourceKind::Registry,
        }
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageReference::Directory(path) | PackageReference::Archive(path) => {
                write!(f, "{}", path.display())
            }
            PackageReference::Registry { name, req } => write!(f, "{}@{}", name, req),
        }
    }
}

/// The kind of source a package was acquired from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Directory,
    Archive,
    Registry,
}

fn has_archive_suffix(s: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|suffix| s.ends_with(suffix))
}

/// Split `name[@requirement]`, taking care of the leading `@` of scopes
pub fn parse_refstring(s: &str) -> Result<(String, VersionReq)> {
    let s = s.trim();
    let split_at = match s.strip_prefix('@') {
        Some(rest) => rest.find('@').map(|i| i + 1),
        None => s.find('@'),
    };

    let (name, req) = match split_at {
        Some(i) => (&s[..i], VersionReq::parse(&s[i + 1..])?),
        None => (s, VersionReq::any()),
    };

    if !is_valid_package_name(name) {
        return Err(PackageError::InvalidReference {
            reference: s.to_string(),
            message: format!("'{}' is not a valid package name", name),
        });
    }

    Ok((name.to_string(), req))
}
