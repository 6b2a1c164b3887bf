//! Proxy executables in the bin directory of an install tree

use crate::{InstallContext, PackageError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(unix)]
const MARKER: &str = "# ppym-proxy: ";
#[cfg(windows)]
const MARKER: &str = "REM ppym-proxy: ";

/// What a proxy runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    /// A package script run through the module interpreter
    Script { interpreter: String, script: PathBuf },
    /// An executable produced by the native installer, with path-like
    /// variables to prepend to before running it
    Executable {
        program: PathBuf,
        prepend_env: Vec<(String, PathBuf)>,
    },
}

impl ProxyTarget {
    /// The file the proxy ultimately runs; two proxies are the same link
    /// exactly when this matches
    pub fn target_path(&self) -> &Path {
        match self {
            ProxyTarget::Script { script, .. } => script,
            ProxyTarget::Executable { program, .. } => program,
        }
    }
}

/// Creates and removes bin proxies
#[derive(Debug, Clone)]
pub struct BinLinker {
    interpreter: String,
}

impl BinLinker {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    /// Expose a package script as `name` in the tree's bin directory
    pub fn link(&self, name: &str, script: &Path, ctx: &InstallContext) -> Result<PathBuf> {
        let target = ProxyTarget::Script {
            interpreter: self.interpreter.clone(),
            script: absolute(script)?,
        };
        self.link_target(name, &target, ctx.bin_dir())
    }

    /// Write a proxy for `target`.
    ///
    /// Re-linking a name to the file it already runs is allowed; a name
    /// taken by anything else is a [`PackageError::BinNameConflict`].
    pub fn link_target(&self, name: &str, target: &ProxyTarget, bin_dir: &Path) -> Result<PathBuf> {
        let path = proxy_path(bin_dir, name);
        let requested = target.target_path().display().to_string();

        if path.exists() {
            let existing = read_proxy_target(&path)?;
            match existing {
                Some(existing) if existing == requested => {
                    debug!("Proxy {} already points to {}", name, requested);
                }
                other => {
                    return Err(PackageError::BinNameConflict {
                        name: name.to_string(),
                        existing: other.unwrap_or_else(|| path.display().to_string()),
                        requested,
                    });
                }
            }
        }

        fs::create_dir_all(bin_dir)?;
        fs::write(&path, render_proxy(target))?;
        make_executable(&path)?;
        info!("Linked {} -> {}", name, requested);
        Ok(path)
    }

    /// Remove the proxy `name` from the tree's bin directory.
    ///
    /// Returns whether a proxy was removed. Files not written by the linker
    /// are left alone.
    pub fn unlink(&self, name: &str, ctx: &InstallContext) -> Result<bool> {
        let path = proxy_path(ctx.bin_dir(), name);
        if !path.exists() {
            return Ok(false);
        }
        if read_proxy_target(&path)?.is_none() {
            debug!("Not removing {}: not a ppym proxy", path.display());
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!("Unlinked {}", name);
        Ok(true)
    }

    /// Wrap every executable the native installer produced into the tree's
    /// bin directory, returning the exposed names
    pub fn wrap_native(&self, ctx: &InstallContext) -> Result<Vec<String>> {
        let native_bin = ctx.pip_bin_dir();
        let mut names = Vec::new();
        if !native_bin.is_dir() {
            return Ok(names);
        }

        let mut entries: Vec<_> = fs::read_dir(&native_bin)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            if let Some(name) = self.wrap_executable(&entry.path(), ctx)? {
                names.push(name);
            }
        }

        Ok(names)
    }

    /// Wrap one native executable, returning its exposed name.
    ///
    /// Non-executable files are skipped with `None`.
    pub fn wrap_executable(&self, program: &Path, ctx: &InstallContext) -> Result<Option<String>> {
        if !program.is_file() || !is_executable(program)? {
            return Ok(None);
        }
        let Some(name) = native_command_name(program) else {
            return Ok(None);
        };

        let target = ProxyTarget::Executable {
            program: absolute(program)?,
            prepend_env: vec![("PYTHONPATH".to_string(), absolute(ctx.pip_dir())?)],
        };
        self.link_target(&name, &target, ctx.bin_dir())?;
        Ok(Some(name))
    }

    /// The file a proxy in the tree runs, if `name` is a ppym proxy
    pub fn proxy_target(&self, name: &str, ctx: &InstallContext) -> Result<Option<String>> {
        let path = proxy_path(ctx.bin_dir(), name);
        if !path.exists() {
            return Ok(None);
        }
        read_proxy_target(&path)
    }
}

/// File name of the proxy for `name`
pub fn proxy_path(bin_dir: &Path, name: &str) -> PathBuf {
    if cfg!(windows) {
        bin_dir.join(format!("{}.cmd", name))
    } else {
        bin_dir.join(name)
    }
}

fn read_proxy_target(path: &Path) -> Result<Option<String>> {
    let Ok(content) = fs::read_to_string(path) else {
        return Ok(None);
    };
    Ok(content
        .lines()
        .find_map(|line| line.strip_prefix(MARKER))
        .map(|target| target.trim().to_string()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn native_command_name(program: &Path) -> Option<String> {
    let name = if cfg!(windows) {
        program.file_stem()?
    } else {
        program.file_name()?
    };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(unix)]
fn render_proxy(target: &ProxyTarget) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!("{}{}\n", MARKER, target.target_path().display()));
    match target {
        ProxyTarget::Script {
            interpreter,
            script: path,
        } => {
            script.push_str(&format!(
                "exec {} {} \"$@\"\n",
                sh_quote(interpreter),
                sh_quote(&path.display().to_string())
            ));
        }
        ProxyTarget::Executable {
            program,
            prepend_env,
        } => {
            for (key, value) in prepend_env {
                script.push_str(&format!(
                    "{key}={}${{{key}:+:${key}}}\nexport {key}\n",
                    sh_quote(&value.display().to_string()),
                    key = key
                ));
            }
            script.push_str(&format!(
                "exec {} \"$@\"\n",
                sh_quote(&program.display().to_string())
            ));
        }
    }
    script
}

#[cfg(windows)]
fn render_proxy(target: &ProxyTarget) -> String {
    let mut script = String::from("@echo off\r\n");
    script.push_str(&format!("{}{}\r\n", MARKER, target.target_path().display()));
    match target {
        ProxyTarget::Script {
            interpreter,
            script: path,
        } => {
            script.push_str(&format!("\"{}\" \"{}\" %*\r\n", interpreter, path.display()));
        }
        ProxyTarget::Executable {
            program,
            prepend_env,
        } => {
            for (key, value) in prepend_env {
                script.push_str(&format!(
                    "set \"{key}={};%{key}%\"\r\n",
                    value.display(),
                    key = key
                ));
            }
            script.push_str(&format!("\"{}\" %*\r\n", program.display()));
        }
    }
    script
}

#[cfg(unix)]
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> Result<bool> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    Ok(matches!(ext.as_deref(), Some("exe" | "cmd" | "bat")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_link_writes_executable_proxy() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        let script = temp.path().join("pkg/bin/foo.script");

        let linker = BinLinker::new("nodepy");
        let path = linker.link("foo", &script, &ctx).unwrap();

        assert_eq!(path, ctx.bin_dir().join("foo"));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("exec 'nodepy' '{}' \"$@\"", script.display())));
        assert_eq!(
            linker.proxy_target("foo", &ctx).unwrap(),
            Some(script.display().to_string())
        );
    }

    #[test]
    fn test_relink_same_target_is_allowed() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        let script = temp.path().join("a.script");
        let linker = BinLinker::new("nodepy");

        linker.link("foo", &script, &ctx).unwrap();
        linker.link("foo", &script, &ctx).unwrap();
    }

    #[test]
    fn test_conflicting_target_is_rejected() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        let linker = BinLinker::new("nodepy");

        linker.link("foo", &temp.path().join("a.script"), &ctx).unwrap();
        let err = linker
            .link("foo", &temp.path().join("b.script"), &ctx)
            .unwrap_err();
        assert!(matches!(err, PackageError::BinNameConflict { .. }));

        // the original proxy is untouched
        assert_eq!(
            linker.proxy_target("foo", &ctx).unwrap(),
            Some(temp.path().join("a.script").display().to_string())
        );
    }

    #[test]
    fn test_foreign_file_is_a_conflict_and_survives_unlink() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        fs::create_dir_all(ctx.bin_dir()).unwrap();
        fs::write(ctx.bin_dir().join("tool"), "#!/bin/sh\necho mine\n").unwrap();

        let linker = BinLinker::new("nodepy");
        assert!(linker
            .link("tool", &temp.path().join("x.script"), &ctx)
            .is_err());
        assert!(!linker.unlink("tool", &ctx).unwrap());
        assert!(ctx.bin_dir().join("tool").exists());
    }

    #[test]
    fn test_unlink_removes_proxy() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        let linker = BinLinker::new("nodepy");
        linker.link("foo", &temp.path().join("a.script"), &ctx).unwrap();

        assert!(linker.unlink("foo", &ctx).unwrap());
        assert!(!ctx.bin_dir().join("foo").exists());
        assert!(!linker.unlink("foo", &ctx).unwrap());
    }

    #[test]
    fn test_wrap_native_executables() {
        let temp = TempDir::new().unwrap();
        let ctx = InstallContext::local(temp.path());
        let native_bin = ctx.pip_bin_dir();
        fs::create_dir_all(&native_bin).unwrap();

        let tool = native_bin.join("native-tool");
        fs::write(&tool, "#!/bin/sh\necho \"$PYTHONPATH\"\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(native_bin.join("README"), "not executable").unwrap();

        let linker = BinLinker::new("nodepy");
        let names = linker.wrap_native(&ctx).unwrap();
        assert_eq!(names, vec!["native-tool".to_string()]);

        let output = Command::new(ctx.bin_dir().join("native-tool"))
            .env_remove("PYTHONPATH")
            .output()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            ctx.pip_dir().display().to_string()
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }
}
