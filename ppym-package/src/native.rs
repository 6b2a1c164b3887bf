//! Installing Python dependencies through pip

use crate::{PackageError, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Installs packages of the native (Python) ecosystem into a target directory.
#[cfg_attr(test, mockall::automock)]
pub trait NativeDependencyInstaller: Send + Sync {
    /// Install `specs` (such as `requests>=2.0`) into `target`
    fn install(&self, specs: &[String], target: &Path) -> Result<()>;
}

/// `python -m pip install --target`
#[derive(Debug, Clone)]
pub struct PipInstaller {
    python: String,
}

impl PipInstaller {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

impl NativeDependencyInstaller for PipInstaller {
    fn install(&self, specs: &[String], target: &Path) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(target)?;

        info!("Installing Python dependencies: {}", specs.join(" "));
        let status = Command::new(&self.python)
            .args(["-m", "pip", "install", "--upgrade", "--target"])
            .arg(target)
            .args(specs)
            .status()?;

        if !status.success() {
            return Err(PackageError::ValidationError {
                message: format!(
                    "pip install {} failed with {}",
                    specs.join(" "),
                    status
                ),
            });
        }
        Ok(())
    }
}

/// Pip specs of a manifest's `python-dependencies`, sorted by name
pub fn pip_specs<'a, I>(dependencies: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut specs: Vec<_> = dependencies
        .into_iter()
        .map(|(name, spec)| {
            let spec = spec.trim();
            if spec.is_empty() || spec == "*" {
                name.clone()
            } else if spec.starts_with(|c: char| c.is_ascii_digit()) {
                format!("{}=={}", name, spec)
            } else {
                format!("{}{}", name, spec)
            }
        })
        .collect();
    specs.sort();
    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_pip_specs() {
        let mut deps = HashMap::new();
        deps.insert("requests".to_string(), ">=2.0".to_string());
        deps.insert("six".to_string(), "*".to_string());
        deps.insert("attrs".to_string(), "19.1.0".to_string());

        assert_eq!(
            pip_specs(&deps),
            vec!["attrs==19.1.0", "requests>=2.0", "six"]
        );
    }

    #[test]
    fn test_nothing_to_install_skips_pip() {
        let temp = TempDir::new().unwrap();
        let installer = PipInstaller::new("definitely-not-a-python");
        installer.install(&[], &temp.path().join("pip")).unwrap();
        assert!(!temp.path().join("pip").exists());
    }

    #[test]
    fn test_missing_interpreter_is_an_error() {
        let temp = TempDir::new().unwrap();
        let installer = PipInstaller::new("definitely-not-a-python");
        let result = installer.install(&["six".to_string()], &temp.path().join("pip"));
        assert!(matches!(result, Err(PackageError::Io(_))));
    }
}
