//! Install trees and the lock that serializes access to them

use crate::{PackageConfig, PackageError, Result};
use fs2::{lock_contended_error, FileExt};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Directory holding installed packages, relative to a project or prefix
pub const MODULES_DIR: &str = "nodepy_modules";

const LOCK_FILE: &str = ".ppym.lock";
const STAGING_DIR: &str = ".ppym-tmp";

/// One install tree (local project or global prefix).
///
/// Every install and uninstall operates on a context; holding a locked
/// context is what gives an operation exclusive use of the tree.
#[derive(Debug)]
pub struct InstallContext {
    global: bool,
    packages_dir: PathBuf,
    bin_dir: PathBuf,
    pip_dir: PathBuf,
    lock: Option<TreeLock>,
}

impl InstallContext {
    /// The tree of a project: `<project>/nodepy_modules`
    pub fn local(project_dir: &Path) -> Self {
        let packages_dir = project_dir.join(MODULES_DIR);
        Self {
            global: false,
            bin_dir: packages_dir.join(".bin"),
            pip_dir: packages_dir.join(".pip"),
            packages_dir,
            lock: None,
        }
    }

    /// The global tree under `prefix`
    pub fn global(prefix: &Path) -> Self {
        Self {
            global: true,
            packages_dir: prefix.join(MODULES_DIR),
            bin_dir: prefix.join("bin"),
            pip_dir: prefix.join("pip"),
            lock: None,
        }
    }

    pub fn from_config(config: &PackageConfig, project_dir: &Path, global: bool) -> Self {
        if global {
            Self::global(&config.prefix)
        } else {
            Self::local(project_dir)
        }
    }

    /// Take the tree lock, waiting up to `timeout` for another holder
    pub fn lock(mut self, timeout: Duration) -> Result<Self> {
        if self.lock.is_none() {
            fs::create_dir_all(&self.packages_dir)?;
            self.lock = Some(TreeLock::acquire(&self.packages_dir.join(LOCK_FILE), timeout)?);
        }
        Ok(self)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Target directory of the native (pip) installer
    pub fn pip_dir(&self) -> &Path {
        &self.pip_dir
    }

    pub fn pip_bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.pip_dir.join("Scripts")
        } else {
            self.pip_dir.join("bin")
        }
    }

    /// Where a package of this name lives in the tree
    pub fn package_dir(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.packages_dir.clone(), |dir, part| dir.join(part))
    }

    /// Scratch space on the same filesystem as the tree, for atomic renames
    pub fn staging_dir(&self) -> Result<PathBuf> {
        let dir = self.packages_dir.join(STAGING_DIR);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove the staging directory if nothing is left in it
    pub(crate) fn clear_staging(&self) {
        let dir = self.packages_dir.join(STAGING_DIR);
        if dir.is_dir() && fs::remove_dir(&dir).is_err() {
            debug!("Leaving non-empty {}", dir.display());
        }
    }

    pub(crate) fn require_lock(&self) -> Result<()> {
        if self.lock.is_none() {
            return Err(PackageError::TreeLocked {
                path: self.packages_dir.clone(),
            });
        }
        Ok(())
    }
}

/// Exclusive lock on an install tree.
///
/// Held as an OS file lock on an open handle, so it is released when the
/// handle is dropped or the process exits.
#[derive(Debug)]
pub struct TreeLock {
    _file: File,
}

impl TreeLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Locked {}", path.display());
                    return Ok(Self { _file: file });
                }
                Err(e) if e.kind() == lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(PackageError::TreeLocked {
                            path: path.parent().unwrap_or(path).to_path_buf(),
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_layout() {
        let ctx = InstallContext::local(Path::new("/project"));
        assert!(!ctx.is_global());
        assert_eq!(ctx.packages_dir(), Path::new("/project/nodepy_modules"));
        assert_eq!(ctx.bin_dir(), Path::new("/project/nodepy_modules/.bin"));
        assert_eq!(
            ctx.package_dir("@scope/foo"),
            Path::new("/project/nodepy_modules/@scope/foo")
        );
    }

    #[test]
    fn test_global_layout() {
        let ctx = InstallContext::global(Path::new("/opt/ppym"));
        assert!(ctx.is_global());
        assert_eq!(ctx.bin_dir(), Path::new("/opt/ppym/bin"));
        assert_eq!(ctx.pip_dir(), Path::new("/opt/ppym/pip"));
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let temp = TempDir::new().unwrap();

        let first = InstallContext::local(temp.path())
            .lock(Duration::from_millis(0))
            .unwrap();
        assert!(first.is_locked());

        let err = InstallContext::local(temp.path())
            .lock(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, PackageError::TreeLocked { .. }));

        drop(first);
        assert!(InstallContext::local(temp.path())
            .lock(Duration::from_millis(0))
            .is_ok());
    }

    #[test]
    fn test_local_and_global_lock_independently() {
        let temp = TempDir::new().unwrap();
        let _local = InstallContext::local(&temp.path().join("project"))
            .lock(Duration::from_millis(0))
            .unwrap();
        let global = InstallContext::global(&temp.path().join("prefix")).lock(Duration::from_millis(0));
        assert!(global.is_ok());
    }

    const HOLDER_ENV: &str = "PPYM_TEST_LOCK_HOLDER_ROOT";

    /// Run by the test below in a child process: take the lock and wait to be killed
    #[test]
    #[ignore]
    fn hold_tree_lock_until_killed() {
        let Some(root) = std::env::var_os(HOLDER_ENV) else {
            return;
        };
        let root = PathBuf::from(root);
        let _ctx = InstallContext::local(&root)
            .lock(Duration::from_secs(5))
            .unwrap();
        fs::write(root.join("locked"), "").unwrap();
        thread::sleep(Duration::from_secs(60));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_of_killed_process_is_released() {
        use std::process::{Command, Stdio};

        let temp = TempDir::new().unwrap();
        let mut holder = Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "context::tests::hold_tree_lock_until_killed",
                "--ignored",
                "--nocapture",
            ])
            .env(HOLDER_ENV, temp.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while !temp.path().join("locked").exists() {
            assert!(Instant::now() < deadline, "lock holder never started");
            thread::sleep(Duration::from_millis(20));
        }

        let err = InstallContext::local(temp.path())
            .lock(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, PackageError::TreeLocked { .. }));

        // SIGKILL: no destructors run in the holder
        holder.kill().unwrap();
        holder.wait().unwrap();

        let ctx = InstallContext::local(temp.path())
            .lock(Duration::from_millis(500))
            .unwrap();
        assert!(ctx.is_locked());
    }
}
