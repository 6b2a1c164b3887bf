//! Install records kept next to each installed package

use crate::reference::SourceKind;
use crate::{InstallContext, PackageError, Result, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the record inside an installed package directory
pub const RECORD_FILE: &str = ".ppym-record.json";

/// What the installer left behind for one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPackageRecord {
    /// Record format version
    #[serde(default = "current_format")]
    pub format: u32,

    pub name: String,

    pub version: Version,

    /// Directory the package was placed in
    pub install_root: PathBuf,

    /// Directory holding the package's files; differs from `install_root` in develop mode
    pub package_root: PathBuf,

    /// Bin proxies created for this package, including wrapped native ones
    #[serde(default)]
    pub bins: BTreeSet<String>,

    pub global: bool,

    pub source: SourceKind,

    #[serde(default)]
    pub develop: bool,

    /// Set when the post-install hook failed
    #[serde(default)]
    pub dirty: bool,

    pub installed_at: DateTime<Utc>,
}

fn current_format() -> u32 {
    InstalledPackageRecord::CURRENT_FORMAT
}

impl InstalledPackageRecord {
    pub const CURRENT_FORMAT: u32 = 1;

    /// Load the record of a package directory
    pub fn load(package_dir: &Path) -> Result<Self> {
        let path = package_dir.join(RECORD_FILE);
        let content = fs::read_to_string(&path)?;
        let record: Self = serde_json::from_str(&content)?;

        if record.format > Self::CURRENT_FORMAT {
            return Err(PackageError::ValidationError {
                message: format!(
                    "Record {} has format {}, newer than supported {}",
                    path.display(),
                    record.format,
                    Self::CURRENT_FORMAT
                ),
            });
        }
        Ok(record)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(self.install_root.join(RECORD_FILE), content)?;
        Ok(())
    }

    pub fn identifier(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Read access to the records of one install tree
pub struct RecordStore<'a> {
    ctx: &'a InstallContext,
}

impl<'a> RecordStore<'a> {
    pub fn new(ctx: &'a InstallContext) -> Self {
        Self { ctx }
    }

    /// The record of an installed package, if there is one
    pub fn get(&self, name: &str) -> Result<Option<InstalledPackageRecord>> {
        let dir = self.ctx.package_dir(name);
        if !dir.join(RECORD_FILE).is_file() {
            return Ok(None);
        }
        InstalledPackageRecord::load(&dir).map(Some)
    }

    /// All records in the tree, sorted by name
    pub fn list(&self) -> Result<Vec<InstalledPackageRecord>> {
        let mut records = Vec::new();
        let root = self.ctx.packages_dir();
        if !root.is_dir() {
            return Ok(records);
        }

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('@') {
                for scoped in fs::read_dir(entry.path())? {
                    let scoped = scoped?;
                    if scoped.path().join(RECORD_FILE).is_file() {
                        records.push(InstalledPackageRecord::load(&scoped.path())?);
                    }
                }
            } else if entry.path().join(RECORD_FILE).is_file() {
                records.push(InstalledPackageRecord::load(&entry.path())?);
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// A package other than `except` that exposes `bin` in this tree.
    ///
    /// Proxies of native executables are shared by every package whose
    /// Python dependencies produced them.
    pub fn bin_owner(&self, bin: &str, except: &str) -> Result<Option<InstalledPackageRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.name != except && r.bins.contains(bin)))
    }
}
