//! Lifecycle script execution

use crate::manifest::LifecycleEvent;
use crate::{Manifest, PackageError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How a lifecycle script ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    /// The package has no script for the event
    Skipped,
    Exited(i32),
    /// Terminated by a signal
    Killed,
}

impl ScriptStatus {
    pub fn success(&self) -> bool {
        matches!(self, ScriptStatus::Skipped | ScriptStatus::Exited(0))
    }

    fn code(&self) -> Option<i32> {
        match self {
            ScriptStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ScriptStatus {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ScriptStatus::Exited(code),
            None => ScriptStatus::Killed,
        }
    }
}

/// Runs manifest scripts through the platform shell
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    timeout: Option<Duration>,
}

impl ScriptRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Run the script for `event`, if the package has one.
    ///
    /// `bin_dirs` are prepended to `PATH` so a script can call the package's
    /// own binaries and those of its dependencies.
    pub fn run(
        &self,
        manifest: &Manifest,
        event: LifecycleEvent,
        cwd: &Path,
        bin_dirs: &[PathBuf],
    ) -> Result<ScriptStatus> {
        let Some(script) = manifest.get_script(event) else {
            debug!("No {} script for {}", event, manifest.name);
            return Ok(ScriptStatus::Skipped);
        };

        info!("Running {} script of {}: {}", event, manifest.identifier(), script);

        let mut command = shell_command(script);
        command
            .current_dir(cwd)
            .env("PATH", search_path(bin_dirs)?)
            .env("PPYM_PACKAGE_NAME", &manifest.name)
            .env("PPYM_PACKAGE_VERSION", manifest.version.to_string())
            .env("PPYM_LIFECYCLE_EVENT", event.as_str());
        own_process_group(&mut command);

        let mut child = command.spawn()?;
        let status = match self.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        kill_process_group(&mut child);
                        return Err(PackageError::LifecycleScriptTimeout {
                            package: manifest.identifier(),
                            event: event.to_string(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
        };

        Ok(status.into())
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error
    pub fn run_checked(
        &self,
        manifest: &Manifest,
        event: LifecycleEvent,
        cwd: &Path,
        bin_dirs: &[PathBuf],
    ) -> Result<()> {
        let status = self.run(manifest, event, cwd, bin_dirs)?;
        if !status.success() {
            return Err(PackageError::LifecycleScriptFailed {
                package: manifest.identifier(),
                event: event.to_string(),
                code: status.code(),
            });
        }
        Ok(())
    }
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(unix)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

/// Make the script the leader of a new process group, so a timeout can
/// stop everything it started
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn own_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    // SAFETY: killpg only sends a signal; the group id is the pid of a child
    // we have not reaped yet, so it cannot have been reused
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
    child.wait().ok();
}

#[cfg(windows)]
fn kill_process_group(child: &mut Child) {
    child.kill().ok();
    child.wait().ok();
}

fn search_path(bin_dirs: &[PathBuf]) -> Result<OsString> {
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let dirs = bin_dirs
        .iter()
        .cloned()
        .chain(std::env::split_paths(&inherited));
    std::env::join_paths(dirs).map_err(|e| PackageError::ValidationError {
        message: format!("Cannot build PATH for script: {}", e),
    })
}
