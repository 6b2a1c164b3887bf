//! Package installation and management

use crate::archive::{package_files, unpack, unpack_file};
use crate::error::{Phase, PhaseExt};
use crate::linker::{proxy_path, BinLinker};
use crate::manifest::LifecycleEvent;
use crate::native::{pip_specs, NativeDependencyInstaller, PipInstaller};
use crate::record::{InstalledPackageRecord, RecordStore};
use crate::resolver::ResolvedDependency;
use crate::scripts::ScriptRunner;
use crate::{
    DependencyResolver, InstallContext, Manifest, PackageConfig, PackageError, PackageReference,
    Registry, Result,
};
use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// File placed in the tree instead of a copy when installing in develop mode
pub const DEVELOP_LINK_FILE: &str = ".nodepy-link";

/// Install options.
///
/// Whether the install is global is a property of the [`InstallContext`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Link a directory reference into the tree instead of copying it
    pub develop: bool,

    /// Re-install packages that are already installed
    pub upgrade: bool,

    /// Fail on conflicting version requirements instead of keeping the first
    pub strict: bool,
}

/// What an install run did
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Packages placed by this run, dependencies before their dependents
    pub installed: Vec<InstalledPackageRecord>,

    /// Packages that were already installed and left alone
    pub skipped: Vec<InstalledPackageRecord>,

    /// Failed post-install hooks; their packages are recorded as dirty
    pub hook_failures: Vec<PackageError>,
}

impl InstallReport {
    pub fn is_clean(&self) -> bool {
        self.hook_failures.is_empty()
    }
}

/// Result of installing one reference
#[derive(Debug)]
pub struct InstallOutcome {
    /// Record of the requested package
    pub record: InstalledPackageRecord,
    pub report: InstallReport,
}

/// State shared by the recursive steps of one install run
struct Session<'a> {
    ctx: &'a InstallContext,
    options: InstallOptions,
    plan: FxHashMap<String, ResolvedDependency>,
    visiting: FxHashSet<String>,
    done: FxHashMap<String, InstalledPackageRecord>,
    report: InstallReport,
}

impl<'a> Session<'a> {
    fn new(ctx: &'a InstallContext, options: InstallOptions, plan: Vec<ResolvedDependency>) -> Self {
        Self {
            ctx,
            options,
            plan: plan.into_iter().map(|d| (d.name.clone(), d)).collect(),
            visiting: FxHashSet::default(),
            done: FxHashMap::default(),
            report: InstallReport::default(),
        }
    }

    fn skip(&mut self, record: InstalledPackageRecord) -> InstalledPackageRecord {
        self.done.insert(record.name.clone(), record.clone());
        self.report.skipped.push(record.clone());
        record
    }
}

/// A package whose files are available but not yet in the tree
struct Acquired {
    manifest: Manifest,
    /// Where the files are now
    dir: PathBuf,
    /// Keeps unpacked files alive until they are placed
    staging: Option<TempDir>,
}

/// Package installer
pub struct Installer {
    /// Registry to use
    registry: Arc<dyn Registry>,

    scripts: ScriptRunner,

    linker: BinLinker,

    native: Box<dyn NativeDependencyInstaller>,
}

impl Installer {
    /// Create a new package installer
    pub fn new(config: &PackageConfig, registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            scripts: ScriptRunner::new(config.script_timeout()),
            linker: BinLinker::new(config.interpreter.clone()),
            native: Box::new(PipInstaller::new(config.python.clone())),
        }
    }

    pub fn with_native_installer(mut self, native: Box<dyn NativeDependencyInstaller>) -> Self {
        self.native = native;
        self
    }

    pub fn with_script_runner(mut self, scripts: ScriptRunner) -> Self {
        self.scripts = scripts;
        self
    }

    /// Install a package and its dependencies into a locked tree.
    ///
    /// The whole dependency closure is resolved before anything is acquired,
    /// so an unresolvable dependency fails the install before any hook runs.
    pub fn install(
        &self,
        reference: &PackageReference,
        ctx: &InstallContext,
        options: InstallOptions,
    ) -> Result<InstallOutcome> {
        ctx.require_lock()?;
        let label = reference.to_string();

        let plan = DependencyResolver::new(Arc::clone(&self.registry))
            .strict(options.strict)
            .resolve_reference(reference)
            .phase(&label, Phase::Acquire)?;
        let root = plan
            .first()
            .cloned()
            .ok_or_else(|| PackageError::PackageNotFound {
                name: label.clone(),
                version: "*".to_string(),
            })?;
        info!("Resolved {} packages for {}", plan.len(), root.identifier());

        let mut session = Session::new(ctx, options, plan);
        let develop = options.develop && matches!(root.reference, PackageReference::Directory(_));
        let result = self.install_resolved(&mut session, &root, develop);
        ctx.clear_staging();

        Ok(InstallOutcome {
            record: result?,
            report: session.report,
        })
    }

    /// Install the dependencies declared by the manifest of `dir`
    pub fn install_dependencies(
        &self,
        manifest: &Manifest,
        dir: &Path,
        ctx: &InstallContext,
        options: InstallOptions,
    ) -> Result<InstallReport> {
        ctx.require_lock()?;
        let id = manifest.identifier();

        let plan = DependencyResolver::new(Arc::clone(&self.registry))
            .strict(options.strict)
            .resolve(manifest, dir)
            .phase(&id, Phase::Dependencies)?;
        let direct: Vec<_> = plan.iter().filter(|d| d.direct).cloned().collect();
        info!("Installing {} dependencies of {}", direct.len(), id);

        let mut session = Session::new(ctx, options, plan);
        session.visiting.insert(manifest.name.clone());

        let result = self.install_direct(&mut session, manifest, &direct);
        ctx.clear_staging();
        result.phase(&id, Phase::Dependencies)?;

        Ok(session.report)
    }

    fn install_direct(
        &self,
        session: &mut Session<'_>,
        manifest: &Manifest,
        direct: &[ResolvedDependency],
    ) -> Result<()> {
        for dep in direct {
            self.install_resolved(session, dep, false)?;
        }
        // wrapped executables of the project itself are not recorded anywhere
        self.install_native(manifest, session.ctx, &mut BTreeSet::new())
    }

    fn install_resolved(
        &self,
        session: &mut Session<'_>,
        resolved: &ResolvedDependency,
        develop: bool,
    ) -> Result<InstalledPackageRecord> {
        let id = resolved.identifier();
        if let Some(record) = session.done.get(&resolved.name) {
            return Ok(record.clone());
        }

        let ctx = session.ctx;
        let existing = RecordStore::new(ctx)
            .get(&resolved.name)
            .phase(&id, Phase::Acquire)?;
        if let Some(existing) = &existing {
            if !session.options.upgrade {
                if existing.version == resolved.version {
                    debug!("{} is already installed", id);
                    return Ok(session.skip(existing.clone()));
                }
                if !resolved.direct {
                    warn!(
                        "Keeping installed {}, {} was requested",
                        existing.identifier(),
                        resolved.version
                    );
                    return Ok(session.skip(existing.clone()));
                }
            }
        }

        info!("Installing {}", id);
        session.visiting.insert(resolved.name.clone());

        let acquired = self.acquire(ctx, resolved).phase(&id, Phase::Acquire)?;
        let bin_path = [ctx.bin_dir().to_path_buf()];

        self.scripts
            .run_checked(&acquired.manifest, LifecycleEvent::PreInstall, &acquired.dir, &bin_path)
            .phase(&id, Phase::PreInstall)?;

        let target = ctx.package_dir(&resolved.name);
        let (package_root, displaced) = self
            .place(
                ctx,
                &acquired.dir,
                acquired.staging,
                &acquired.manifest,
                &target,
                existing.as_ref(),
                develop,
            )
            .phase(&id, Phase::Place)?;
        let manifest = acquired.manifest;

        let mut bins = BTreeSet::new();
        if let Err(e) = self.complete(session, &manifest, &package_root, &mut bins) {
            self.rollback(ctx, &manifest.name, &target, &bins, displaced);
            return Err(e.in_phase(&id, Phase::Link));
        }
        // the replaced install is gone for good from here on
        drop(displaced);

        let dirty = match self.scripts.run_checked(
            &manifest,
            LifecycleEvent::PostInstall,
            &package_root,
            &bin_path,
        ) {
            Ok(()) => false,
            Err(e) => {
                warn!("{} is installed, but its post-install hook failed: {}", id, e);
                session.report.hook_failures.push(e.in_phase(&id, Phase::PostInstall));
                true
            }
        };

        let record = InstalledPackageRecord {
            format: InstalledPackageRecord::CURRENT_FORMAT,
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            install_root: target,
            package_root,
            bins,
            global: ctx.is_global(),
            source: resolved.source(),
            develop,
            dirty,
            installed_at: Utc::now(),
        };
        record.save().phase(&id, Phase::Record)?;
        info!("Installed {}", id);

        session.visiting.remove(&resolved.name);
        session.done.insert(record.name.clone(), record.clone());
        session.report.installed.push(record.clone());
        Ok(record)
    }

    /// Make the package's files available without touching the tree
    fn acquire(&self, ctx: &InstallContext, resolved: &ResolvedDependency) -> Result<Acquired> {
        let acquired = match &resolved.reference {
            PackageReference::Directory(dir) => Acquired {
                manifest: Manifest::from_dir(dir)?,
                dir: dir.clone(),
                staging: None,
            },
            PackageReference::Archive(path) => {
                let staging = staging_dir(ctx)?;
                let dir = staging.path().join("package");
                let manifest = unpack_file(path, &dir)?;
                Acquired {
                    manifest,
                    dir,
                    staging: Some(staging),
                }
            }
            PackageReference::Registry { name, .. } => {
                let bytes = self.registry.download(name, &resolved.version)?;
                let staging = staging_dir(ctx)?;
                let dir = staging.path().join("package");
                let manifest = unpack(&bytes, &dir)?;
                Acquired {
                    manifest,
                    dir,
                    staging: Some(staging),
                }
            }
        };

        if acquired.manifest.name != resolved.name || acquired.manifest.version != resolved.version {
            return Err(PackageError::InvalidReference {
                reference: resolved.reference.to_string(),
                message: format!(
                    "expected {} but found {}",
                    resolved.identifier(),
                    acquired.manifest.identifier()
                ),
            });
        }
        Ok(acquired)
    }

    /// Move acquired files to `target`.
    ///
    /// An older install at `target` is moved aside rather than deleted and is
    /// returned so it can be restored if the rest of the install fails.
    /// Returns the directory the package's files live in.
    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        ctx: &InstallContext,
        source: &Path,
        staging: Option<TempDir>,
        manifest: &Manifest,
        target: &Path,
        previous: Option<&InstalledPackageRecord>,
        develop: bool,
    ) -> Result<(PathBuf, Option<Displaced>)> {
        let displaced = if target.exists() {
            Some(self.displace(ctx, target, previous)?)
        } else {
            None
        };

        match put_files(ctx, source, staging, manifest, target, develop) {
            Ok(package_root) => Ok((package_root, displaced)),
            Err(e) => {
                if target.exists() {
                    let _ = fs::remove_dir_all(target);
                }
                if let Some(displaced) = displaced {
                    displaced.restore(target);
                }
                Err(e)
            }
        }
    }

    /// Dependencies and links of a placed package
    fn complete(
        &self,
        session: &mut Session<'_>,
        manifest: &Manifest,
        package_root: &Path,
        bins: &mut BTreeSet<String>,
    ) -> Result<()> {
        let id = manifest.identifier();
        let ctx = session.ctx;

        let mut names: Vec<_> = manifest.dependencies.keys().collect();
        names.sort();
        for name in names {
            if session.visiting.contains(name.as_str()) {
                debug!("{} depends on {}, which is being installed", id, name);
                continue;
            }
            let dep = session
                .plan
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| PackageError::PackageNotFound {
                    name: name.clone(),
                    version: manifest.dependencies[name.as_str()].clone(),
                })
                .phase(&id, Phase::Dependencies)?;
            self.install_resolved(session, &dep, false)
                .phase(&id, Phase::Dependencies)?;
        }

        self.install_native(manifest, ctx, bins)
            .phase(&id, Phase::Dependencies)?;

        let mut entries: Vec<_> = manifest.bin.iter().collect();
        entries.sort();
        for (name, script) in entries {
            let script = package_root.join(script.trim_start_matches("./"));
            self.linker.link(name, &script, ctx).phase(&id, Phase::Link)?;
            bins.insert(name.clone());
        }
        Ok(())
    }

    /// Install `python-dependencies` and expose the native installer's
    /// executables.
    ///
    /// Every executable in the pip bin directory is wrapped, not only the new
    /// ones, so a reinstall or a second package sharing a Python dependency
    /// still records its proxies.
    fn install_native(
        &self,
        manifest: &Manifest,
        ctx: &InstallContext,
        bins: &mut BTreeSet<String>,
    ) -> Result<()> {
        let specs = pip_specs(&manifest.python_dependencies);
        if specs.is_empty() {
            return Ok(());
        }

        self.native.install(&specs, ctx.pip_dir())?;
        bins.extend(self.linker.wrap_native(ctx)?);
        Ok(())
    }

    /// Undo the placement of a package whose install was aborted, putting
    /// back the install it replaced
    fn rollback(
        &self,
        ctx: &InstallContext,
        name: &str,
        target: &Path,
        bins: &BTreeSet<String>,
        displaced: Option<Displaced>,
    ) {
        let store = RecordStore::new(ctx);
        for bin in bins {
            if matches!(store.bin_owner(bin, name), Ok(Some(_))) {
                continue;
            }
            if let Err(e) = self.linker.unlink(bin, ctx) {
                warn!("Failed to remove link {}: {}", bin, e);
            }
        }
        if target.exists() {
            if let Err(e) = fs::remove_dir_all(target) {
                warn!("Failed to remove {}: {}", target.display(), e);
            }
        }
        match displaced {
            Some(displaced) => displaced.restore(target),
            None => remove_empty_scope(ctx, target),
        }
    }

    /// Move an existing install and its proxies out of the way of its
    /// replacement
    fn displace(
        &self,
        ctx: &InstallContext,
        target: &Path,
        previous: Option<&InstalledPackageRecord>,
    ) -> Result<Displaced> {
        let holder = staging_dir(ctx)?;
        let package = holder.path().join("package");
        fs::rename(target, &package)?;
        let mut displaced = Displaced {
            holder,
            package,
            proxies: Vec::new(),
        };

        let Some(previous) = previous else {
            return Ok(displaced);
        };
        debug!("Moving {} aside", previous.identifier());
        if let Err(e) = self.stash_proxies(ctx, previous, &mut displaced) {
            displaced.restore(target);
            return Err(e);
        }
        Ok(displaced)
    }

    fn stash_proxies(
        &self,
        ctx: &InstallContext,
        previous: &InstalledPackageRecord,
        displaced: &mut Displaced,
    ) -> Result<()> {
        let store = RecordStore::new(ctx);
        let stash = displaced.holder.path().join("bin");
        fs::create_dir_all(&stash)?;

        for bin in &previous.bins {
            if store.bin_owner(bin, &previous.name)?.is_some() {
                continue;
            }
            if self.linker.proxy_target(bin, ctx)?.is_none() {
                continue;
            }
            let proxy = proxy_path(ctx.bin_dir(), bin);
            let stashed = stash.join(bin);
            fs::rename(&proxy, &stashed)?;
            displaced.proxies.push((proxy, stashed));
        }
        Ok(())
    }
}

/// A previous install kept in the staging area until its replacement is
/// complete. Dropping it discards the old files.
struct Displaced {
    holder: TempDir,
    package: PathBuf,
    /// Proxy path in the bin directory and where it is kept meanwhile
    proxies: Vec<(PathBuf, PathBuf)>,
}

impl Displaced {
    fn restore(self, target: &Path) {
        if let Err(e) = fs::rename(&self.package, target) {
            warn!("Failed to restore {}: {}", target.display(), e);
        }
        for (proxy, stashed) in &self.proxies {
            if let Err(e) = fs::rename(stashed, proxy) {
                warn!("Failed to restore {}: {}", proxy.display(), e);
            }
        }
    }
}

fn put_files(
    ctx: &InstallContext,
    source: &Path,
    staging: Option<TempDir>,
    manifest: &Manifest,
    target: &Path,
    develop: bool,
) -> Result<PathBuf> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if develop {
        let source = fs::canonicalize(source)?;
        fs::create_dir_all(target)?;
        fs::write(target.join(DEVELOP_LINK_FILE), source.display().to_string())?;
        return Ok(source);
    }

    match staging {
        Some(_staging) => fs::rename(source, target)?,
        None => {
            let staging = staging_dir(ctx)?;
            let copy = staging.path().join("package");
            copy_package(source, manifest, &copy)?;
            fs::rename(&copy, target)?;
        }
    }
    Ok(target.to_path_buf())
}

fn staging_dir(ctx: &InstallContext) -> Result<TempDir> {
    Ok(tempfile::Builder::new()
        .prefix("stage-")
        .tempdir_in(ctx.staging_dir()?)?)
}

/// Copy the distributable files of a package directory
fn copy_package(source: &Path, manifest: &Manifest, dest: &Path) -> Result<()> {
    for file in package_files(source, manifest)? {
        let target = dest.join(&file.relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file.path, &target)?;
    }
    Ok(())
}

/// Remove the `@scope` directory above a package once it is empty
pub(crate) fn remove_empty_scope(ctx: &InstallContext, package_dir: &Path) {
    let Some(parent) = package_dir.parent() else {
        return;
    };
    let is_scope = parent != ctx.packages_dir()
        && parent
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('@'))
            .unwrap_or(false);
    if is_scope {
        // fails harmlessly while other scoped packages remain
        let _ = fs::remove_dir(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use crate::reference::SourceKind;
    use std::time::Duration;

    fn installer(temp: &TempDir) -> Installer {
        let registry = Arc::new(LocalRegistry::new(temp.path().join("registry")));
        Installer::new(&PackageConfig::default(), registry)
    }

    fn write_package(dir: &Path, json: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(crate::manifest::MANIFEST_FILE), json).unwrap();
    }

    #[test]
    fn test_install_requires_lock() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        write_package(&src, r#"{"name": "plain", "version": "1.0.0"}"#);

        let ctx = InstallContext::local(&temp.path().join("project"));
        let err = installer(&temp)
            .install(&PackageReference::Directory(src), &ctx, InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, PackageError::TreeLocked { .. }));
    }

    #[test]
    fn test_install_directory_copies_distributable_files() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        write_package(&src, r#"{"name": "plain", "version": "1.0.0"}"#);
        fs::write(src.join("index.py"), "x = 1\n").unwrap();
        fs::write(src.join("cache.pyc"), "junk").unwrap();

        let ctx = InstallContext::local(&temp.path().join("project"))
            .lock(Duration::from_secs(1))
            .unwrap();
        let outcome = installer(&temp)
            .install(&PackageReference::Directory(src), &ctx, InstallOptions::default())
            .unwrap();

        let dir = ctx.package_dir("plain");
        assert_eq!(outcome.record.install_root, dir);
        assert_eq!(outcome.record.source, SourceKind::Directory);
        assert!(dir.join("index.py").is_file());
        assert!(!dir.join("cache.pyc").exists());
        assert!(!ctx.packages_dir().join(".ppym-tmp").exists());
    }

    #[test]
    fn test_develop_install_links_source() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        write_package(&src, r#"{"name": "dev", "version": "0.1.0"}"#);

        let ctx = InstallContext::local(&temp.path().join("project"))
            .lock(Duration::from_secs(1))
            .unwrap();
        let options = InstallOptions {
            develop: true,
            ..Default::default()
        };
        let outcome = installer(&temp)
            .install(&PackageReference::Directory(src.clone()), &ctx, options)
            .unwrap();

        let link = fs::read_to_string(ctx.package_dir("dev").join(DEVELOP_LINK_FILE)).unwrap();
        assert_eq!(PathBuf::from(link), fs::canonicalize(&src).unwrap());
        assert!(outcome.record.develop);
        assert_eq!(outcome.record.package_root, fs::canonicalize(&src).unwrap());
        assert!(!ctx.package_dir("dev").join("nodepy.json").exists());
    }

    #[test]
    fn test_missing_dependency_fails_before_placing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        write_package(
            &src,
            r#"{"name": "app", "version": "1.0.0", "dependencies": {"ghost": "^1.0.0"}}"#,
        );

        let ctx = InstallContext::local(&temp.path().join("project"))
            .lock(Duration::from_secs(1))
            .unwrap();
        let err = installer(&temp)
            .install(&PackageReference::Directory(src), &ctx, InstallOptions::default())
            .unwrap_err();

        assert!(matches!(err.root_cause(), PackageError::PackageNotFound { .. }));
        assert!(!ctx.package_dir("app").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_python_dependencies_are_wrapped_and_recorded() {
        use crate::native::MockNativeDependencyInstaller;
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        write_package(
            &src,
            r#"{"name": "pyuser", "version": "1.0.0", "python-dependencies": {"six": "*"}}"#,
        );
        let ctx = InstallContext::local(&temp.path().join("project"))
            .lock(Duration::from_secs(1))
            .unwrap();

        // pip rewrites the same executable on every run
        let tool = ctx.pip_bin_dir().join("six-tool");
        let written = tool.clone();
        let mut native = MockNativeDependencyInstaller::new();
        native
            .expect_install()
            .withf(|specs, target| specs.to_vec() == vec!["six".to_string()] && target.ends_with(".pip"))
            .times(2)
            .returning(move |_, _| {
                fs::create_dir_all(written.parent().unwrap()).unwrap();
                fs::write(&written, "#!/bin/sh\n").unwrap();
                fs::set_permissions(&written, fs::Permissions::from_mode(0o755)).unwrap();
                Ok(())
            });
        let installer = installer(&temp).with_native_installer(Box::new(native));
        let reference = PackageReference::Directory(src);

        let outcome = installer
            .install(&reference, &ctx, InstallOptions::default())
            .unwrap();
        assert!(outcome.record.bins.contains("six-tool"));
        let proxy = fs::read_to_string(ctx.bin_dir().join("six-tool")).unwrap();
        assert!(proxy.contains(&tool.display().to_string()));
        assert!(proxy.contains("PYTHONPATH"));

        let upgrade = InstallOptions {
            upgrade: true,
            ..InstallOptions::default()
        };
        let outcome = installer.install(&reference, &ctx, upgrade).unwrap();
        assert!(outcome.record.bins.contains("six-tool"));
        assert!(ctx.bin_dir().join("six-tool").exists());
    }

    #[test]
    fn test_failed_overwrite_restores_previous_install() {
        let temp = TempDir::new().unwrap();
        let v1 = temp.path().join("v1");
        write_package(
            &v1,
            r#"{"name": "bar", "version": "1.0.0", "bin": {"bar": "cli.py"}}"#,
        );
        fs::write(v1.join("cli.py"), "print(1)\n").unwrap();
        let v2 = temp.path().join("v2");
        write_package(
            &v2,
            r#"{"name": "bar", "version": "2.0.0", "bin": {"bar": "cli.py", "taken": "cli.py"}}"#,
        );
        fs::write(v2.join("cli.py"), "print(2)\n").unwrap();

        let ctx = InstallContext::local(&temp.path().join("project"))
            .lock(Duration::from_secs(1))
            .unwrap();
        let installer = installer(&temp);
        installer
            .install(&PackageReference::Directory(v1), &ctx, InstallOptions::default())
            .unwrap();
        let proxy_before = fs::read_to_string(proxy_path(ctx.bin_dir(), "bar")).unwrap();
        fs::write(proxy_path(ctx.bin_dir(), "taken"), "not a proxy").unwrap();

        let err = installer
            .install(&PackageReference::Directory(v2), &ctx, InstallOptions::default())
            .unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Link));
        assert!(matches!(
            err.root_cause(),
            PackageError::BinNameConflict { .. }
        ));

        let record = RecordStore::new(&ctx).get("bar").unwrap().unwrap();
        assert_eq!(record.version, crate::Version::new(1, 0, 0));
        assert_eq!(
            fs::read_to_string(ctx.package_dir("bar").join("cli.py")).unwrap(),
            "print(1)\n"
        );
        assert_eq!(
            fs::read_to_string(proxy_path(ctx.bin_dir(), "bar")).unwrap(),
            proxy_before
        );
        assert_eq!(
            fs::read_to_string(proxy_path(ctx.bin_dir(), "taken")).unwrap(),
            "not a proxy"
        );
        assert!(!ctx.packages_dir().join(".ppym-tmp").exists());
    }

    #[test]
    fn test_remove_empty_scope() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        let a = ctx.package_dir("@scope/a");
        let b = ctx.package_dir("@scope/b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        fs::remove_dir(&a).unwrap();
        remove_empty_scope(&ctx, &a);
        assert!(ctx.packages_dir().join("@scope").is_dir());

        fs::remove_dir(&b).unwrap();
        remove_empty_scope(&ctx, &b);
        assert!(!ctx.packages_dir().join("@scope").exists());
    }
}
