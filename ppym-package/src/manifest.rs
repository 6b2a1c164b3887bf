//! Package manifest (nodepy.json) handling

use crate::{PackageError, Result, Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// File name of the manifest at a package root
pub const MANIFEST_FILE: &str = "nodepy.json";

/// Package manifest structure (nodepy.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    /// Package name, optionally scoped as `@scope/name`
    pub name: String,

    pub version: Version,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Dependency name to version requirement, archive path or directory path
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub dependencies: HashMap<String, String>,

    /// Python dependencies installed through pip (name to pip specifier)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub python_dependencies: HashMap<String, String>,

    /// Lifecycle event name to shell command
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub scripts: HashMap<String, String>,

    /// Exposed command name to script path relative to the package root
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub bin: HashMap<String, String>,

    /// File selection for distribution archives
    #[serde(default, skip_serializing_if = "DistConfig::is_empty")]
    pub dist: DistConfig,
}

/// Glob patterns controlling which files go into a distribution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_files: Vec<String>,
}

impl DistConfig {
    fn is_empty(&self) -> bool {
        self.include_files.is_empty() && self.exclude_files.is_empty()
    }
}

/// Lifecycle events a package may attach scripts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PreDist,
    PostDist,
    PreInstall,
    PostInstall,
    PostUninstall,
    PrePublish,
    PostPublish,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 7] = [
        LifecycleEvent::PreDist,
        LifecycleEvent::PostDist,
        LifecycleEvent::PreInstall,
        LifecycleEvent::PostInstall,
        LifecycleEvent::PostUninstall,
        LifecycleEvent::PrePublish,
        LifecycleEvent::PostPublish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::PreDist => "pre-dist",
            LifecycleEvent::PostDist => "post-dist",
            LifecycleEvent::PreInstall => "pre-install",
            LifecycleEvent::PostInstall => "post-install",
            LifecycleEvent::PostUninstall => "post-uninstall",
            LifecycleEvent::PrePublish => "pre-publish",
            LifecycleEvent::PostPublish => "post-publish",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == name)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Manifest {
    /// Create a minimal manifest, validating the name
    pub fn new(name: &str, version: Version) -> Result<Self> {
        let manifest = Self {
            name: name.to_string(),
            version,
            description: None,
            author: None,
            license: None,
            repository: None,
            dependencies: HashMap::new(),
            python_dependencies: HashMap::new(),
            scripts: HashMap::new(),
            bin: HashMap::new(),
            dist: DistConfig::default(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a manifest from raw descriptor bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Self::parse_from(bytes, MANIFEST_FILE)
    }

    /// Load the manifest of a package directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        Self::from_file(&dir.join(MANIFEST_FILE))
    }

    /// Load manifest from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let content = fs::read(path).map_err(|e| PackageError::InvalidManifest {
            origin: origin.clone(),
            message: format!("Failed to read file: {}", e),
        })?;

        Self::parse_from(&content, &origin)
    }

    fn parse_from(bytes: &[u8], origin: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| PackageError::InvalidManifest {
                origin: origin.to_string(),
                message: e.to_string(),
            })?;

        manifest.validate().map_err(|e| match e {
            PackageError::InvalidManifest { message, .. } => PackageError::InvalidManifest {
                origin: origin.to_string(),
                message,
            },
            other => other,
        })?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save manifest to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Validate names and dependency declarations
    pub fn validate(&self) -> Result<()> {
        if !is_valid_package_name(&self.name) {
            return Err(PackageError::InvalidManifest {
                origin: MANIFEST_FILE.to_string(),
                message: format!("Invalid package name: '{}'", self.name),
            });
        }

        for (name, req) in &self.dependencies {
            if !is_valid_package_name(name) {
                return Err(PackageError::InvalidManifest {
                    origin: MANIFEST_FILE.to_string(),
                    message: format!("Invalid dependency name: '{}'", name),
                });
            }
            if !is_path_like(req) {
                VersionReq::parse(req).map_err(|_| PackageError::InvalidManifest {
                    origin: MANIFEST_FILE.to_string(),
                    message: format!("Invalid version requirement for '{}': '{}'", name, req),
                })?;
            }
        }

        for (name, script) in &self.bin {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(PackageError::InvalidManifest {
                    origin: MANIFEST_FILE.to_string(),
                    message: format!("Invalid bin name: '{}'", name),
                });
            }
            if Path::new(script).is_absolute() {
                return Err(PackageError::InvalidManifest {
                    origin: MANIFEST_FILE.to_string(),
                    message: format!("Bin '{}' must point inside the package", name),
                });
            }
        }

        Ok(())
    }

    /// Look up the script attached to a lifecycle event
    pub fn get_script(&self, event: LifecycleEvent) -> Option<&str> {
        self.scripts.get(event.as_str()).map(|s| s.as_str())
    }

    /// `name@version`
    pub fn identifier(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Check a name against the `[@scope/]name` grammar
pub fn is_valid_package_name(name: &str) -> bool {
    fn is_valid_part(part: &str) -> bool {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !part.starts_with('.')
    }

    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, rest)) => is_valid_part(scope) && is_valid_part(rest),
            None => false,
        },
        None => is_valid_part(name),
    }
}

/// Dependency values that point at the filesystem instead of the registry
pub(crate) fn is_path_like(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("./")
        || value.starts_with("../")
        || value.starts_with('/')
        || value.starts_with(".\\")
        || value.starts_with("..\\")
        || value.starts_with("file:")
        || Path::new(value).is_absolute()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "name": "@scope/foo",
        "version": "1.0.0",
        "description": "A test package",
        "dependencies": {"bar": "^1.0.0", "local": "./libs/local"},
        "python-dependencies": {"requests": ">=2.0"},
        "scripts": {"post-install": "echo done"},
        "bin": {"foo": "./bin/foo.script"},
        "dist": {"exclude_files": ["*.log"]}
    }"#;

    #[test]
    fn test_manifest_parsing() {
        let manifest = Manifest::parse(FULL.as_bytes()).unwrap();
        assert_eq!(manifest.name, "@scope/foo");
        assert_eq!(manifest.version, Version::new(1, 0, 0));
        assert_eq!(manifest.dependencies.len(), 2);
        assert_eq!(manifest.python_dependencies["requests"], ">=2.0");
        assert_eq!(manifest.bin["foo"], "./bin/foo.script");
        assert_eq!(manifest.dist.exclude_files, vec!["*.log".to_string()]);
        assert_eq!(manifest.identifier(), "@scope/foo@1.0.0");
    }

    #[test]
    fn test_serialize_round_trip() {
        let manifest = Manifest::parse(FULL.as_bytes()).unwrap();
        let json = manifest.to_json().unwrap();
        assert_eq!(Manifest::parse(json.as_bytes()).unwrap(), manifest);
    }

    #[test]
    fn test_missing_required_fields() {
        for json in [r#"{"version": "1.0.0"}"#, r#"{"name": "foo"}"#] {
            let err = Manifest::parse(json.as_bytes()).unwrap_err();
            assert!(matches!(err, PackageError::InvalidManifest { .. }), "{}", err);
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["@/bad", "has space", "", "@scope", "@scope/", "a/b", ".hidden"] {
            let json = format!(r#"{{"name": "{}", "version": "1.0.0"}}"#, name);
            let err = Manifest::parse(json.as_bytes()).unwrap_err();
            assert!(
                matches!(err, PackageError::InvalidManifest { .. }),
                "{} accepted",
                name
            );
        }
    }

    #[test]
    fn test_invalid_version() {
        let err = Manifest::parse(br#"{"name": "foo", "version": "one"}"#).unwrap_err();
        assert!(matches!(err, PackageError::InvalidManifest { .. }));
    }

    #[test]
    fn test_dependency_validation() {
        let mut manifest = Manifest::new("test", Version::new(0, 1, 0)).unwrap();
        manifest
            .dependencies
            .insert("foo".to_string(), "invalid version".to_string());

        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_get_script() {
        let manifest = Manifest::parse(FULL.as_bytes()).unwrap();
        assert_eq!(
            manifest.get_script(LifecycleEvent::PostInstall),
            Some("echo done")
        );
        assert_eq!(manifest.get_script(LifecycleEvent::PreInstall), None);
        assert_eq!(
            LifecycleEvent::from_name("post-uninstall"),
            Some(LifecycleEvent::PostUninstall)
        );
    }

    #[test]
    fn test_scoped_names() {
        assert!(is_valid_package_name("foo"));
        assert!(is_valid_package_name("@scope/foo.bar_baz-1"));
        assert!(!is_valid_package_name("@scope/foo/bar"));
    }
}
