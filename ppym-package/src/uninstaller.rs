//! Removing installed packages

use crate::error::{Phase, PhaseExt};
use crate::installer::remove_empty_scope;
use crate::linker::BinLinker;
use crate::manifest::LifecycleEvent;
use crate::record::{InstalledPackageRecord, RecordStore};
use crate::scripts::ScriptRunner;
use crate::{InstallContext, Manifest, PackageConfig, PackageError, Result};
use std::fs;
use tracing::{debug, info, warn};

/// Result of uninstalling one package
#[derive(Debug)]
pub struct UninstallOutcome {
    /// Record the package was installed with
    pub record: InstalledPackageRecord,

    /// Bin links that were removed
    pub removed_bins: Vec<String>,

    /// Set when the post-uninstall hook failed; the package is removed anyway
    pub hook_failure: Option<PackageError>,
}

/// Reverses what the installer did for a package.
///
/// Dependencies are never removed along with their dependents.
pub struct Uninstaller {
    scripts: ScriptRunner,
    linker: BinLinker,
}

impl Uninstaller {
    pub fn new(config: &PackageConfig) -> Self {
        Self {
            scripts: ScriptRunner::new(config.script_timeout()),
            linker: BinLinker::new(config.interpreter.clone()),
        }
    }

    pub fn with_script_runner(mut self, scripts: ScriptRunner) -> Self {
        self.scripts = scripts;
        self
    }

    /// Uninstall `name` from a locked tree
    pub fn uninstall(&self, name: &str, ctx: &InstallContext) -> Result<UninstallOutcome> {
        ctx.require_lock()?;

        let record = RecordStore::new(ctx)
            .get(name)?
            .ok_or_else(|| PackageError::NotInstalled {
                name: name.to_string(),
            })?;
        let id = record.identifier();
        info!("Uninstalling {}", id);

        let hook_failure = match self.run_post_uninstall(&record, ctx) {
            Ok(()) => None,
            Err(e) => {
                warn!("post-uninstall hook of {} failed: {}", id, e);
                Some(e)
            }
        };

        let store = RecordStore::new(ctx);
        let mut removed_bins = Vec::new();
        for bin in &record.bins {
            if let Some(owner) = store.bin_owner(bin, &record.name).phase(&id, Phase::Uninstall)? {
                debug!("Keeping {}, still used by {}", bin, owner.identifier());
                continue;
            }
            if self.linker.unlink(bin, ctx).phase(&id, Phase::Uninstall)? {
                removed_bins.push(bin.clone());
            }
        }

        // develop installs only remove the link directory, never the source
        fs::remove_dir_all(&record.install_root).phase(&id, Phase::Uninstall)?;
        remove_empty_scope(ctx, &record.install_root);

        info!("Uninstalled {}", id);
        Ok(UninstallOutcome {
            record,
            removed_bins,
            hook_failure,
        })
    }

    fn run_post_uninstall(&self, record: &InstalledPackageRecord, ctx: &InstallContext) -> Result<()> {
        let manifest = match Manifest::from_dir(&record.package_root) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!("No manifest for {}: {}", record.identifier(), e);
                return Ok(());
            }
        };

        self.scripts.run_checked(
            &manifest,
            LifecycleEvent::PostUninstall,
            &record.package_root,
            &[ctx.bin_dir().to_path_buf()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::SourceKind;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn locked(temp: &TempDir) -> InstallContext {
        InstallContext::local(temp.path())
            .lock(Duration::from_secs(1))
            .unwrap()
    }

    fn fake_install(ctx: &InstallContext, name: &str) -> InstalledPackageRecord {
        let dir = ctx.package_dir(name);
        fs::create_dir_all(&dir).unwrap();
        Manifest::new(name, crate::Version::new(1, 0, 0))
            .unwrap()
            .save(&dir.join(crate::manifest::MANIFEST_FILE))
            .unwrap();
        let record = InstalledPackageRecord {
            format: InstalledPackageRecord::CURRENT_FORMAT,
            name: name.to_string(),
            version: crate::Version::new(1, 0, 0),
            install_root: dir.clone(),
            package_root: dir,
            bins: Default::default(),
            global: false,
            source: SourceKind::Registry,
            develop: false,
            dirty: false,
            installed_at: Utc::now(),
        };
        record.save().unwrap();
        record
    }

    #[test]
    fn test_not_installed() {
        let temp = TempDir::new().unwrap();
        let ctx = locked(&temp);
        let err = Uninstaller::new(&PackageConfig::default())
            .uninstall("ghost", &ctx)
            .unwrap_err();
        assert!(matches!(err, PackageError::NotInstalled { .. }));
    }

    #[test]
    fn test_removes_scoped_package_and_empty_scope() {
        let temp = TempDir::new().unwrap();
        let ctx = locked(&temp);
        fake_install(&ctx, "@scope/foo");
        fake_install(&ctx, "bar");

        let outcome = Uninstaller::new(&PackageConfig::default())
            .uninstall("@scope/foo", &ctx)
            .unwrap();
        assert!(outcome.hook_failure.is_none());
        assert!(!ctx.packages_dir().join("@scope").exists());
        assert!(ctx.package_dir("bar").is_dir());
    }

    #[test]
    fn test_shared_proxy_outlives_one_owner() {
        let temp = TempDir::new().unwrap();
        let ctx = locked(&temp);
        let script = temp.path().join("tool.py");
        fs::write(&script, "").unwrap();
        BinLinker::new("nodepy").link("tool", &script, &ctx).unwrap();
        for name in ["first", "second"] {
            let mut record = fake_install(&ctx, name);
            record.bins.insert("tool".to_string());
            record.save().unwrap();
        }

        let uninstaller = Uninstaller::new(&PackageConfig::default());
        let outcome = uninstaller.uninstall("first", &ctx).unwrap();
        assert!(outcome.removed_bins.is_empty());
        assert!(crate::linker::proxy_path(ctx.bin_dir(), "tool").exists());

        let outcome = uninstaller.uninstall("second", &ctx).unwrap();
        assert_eq!(outcome.removed_bins, vec!["tool".to_string()]);
        assert!(!crate::linker::proxy_path(ctx.bin_dir(), "tool").exists());
    }

    #[test]
    fn test_requires_lock() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        assert!(matches!(
            Uninstaller::new(&PackageConfig::default()).uninstall("bar", &ctx),
            Err(PackageError::TreeLocked { .. })
        ));
    }
}
