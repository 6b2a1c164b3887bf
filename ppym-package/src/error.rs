//! Package manager error types

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackageError>;

/// The step of an install or uninstall in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Acquire,
    PreInstall,
    Place,
    Dependencies,
    Link,
    PostInstall,
    Record,
    Uninstall,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Acquire => "acquire",
            Phase::PreInstall => "pre-install",
            Phase::Place => "place",
            Phase::Dependencies => "dependencies",
            Phase::Link => "link",
            Phase::PostInstall => "post-install",
            Phase::Record => "record",
            Phase::Uninstall => "uninstall",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Invalid manifest ({origin}): {message}")]
    InvalidManifest { origin: String, message: String },

    #[error("Invalid version string: {version}")]
    InvalidVersion { version: String },

    #[error("Invalid package reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    #[error("Package not found: {name}@{version}")]
    PackageNotFound { name: String, version: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Corrupt archive {archive}: {message}")]
    CorruptArchive { archive: String, message: String },

    #[error("Checksum mismatch for {package}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("Lifecycle script '{event}' of {package} failed with {}", exit_code_label(.code))]
    LifecycleScriptFailed {
        package: String,
        event: String,
        code: Option<i32>,
    },

    #[error("Lifecycle script '{event}' of {package} timed out after {seconds}s")]
    LifecycleScriptTimeout {
        package: String,
        event: String,
        seconds: u64,
    },

    #[error("Bin name conflict: '{name}' already points to {existing}, refusing to link {requested}")]
    BinNameConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Version mismatch for {package}: expected {expected}, archive contains {found}")]
    VersionMismatch {
        package: String,
        expected: String,
        found: String,
    },

    #[error("Authentication failed: {message}")]
    AuthError { message: String },

    #[error("{package}@{version} has already been published")]
    ConflictError { package: String, version: String },

    #[error("User '{username}' already exists")]
    AlreadyExists { username: String },

    #[error("Validation failed: {message}")]
    ValidationError { message: String },

    #[error("Package {name} is not installed")]
    NotInstalled { name: String },

    #[error("Version conflict: {package} requires {required}, but {found} was already resolved")]
    VersionConflict {
        package: String,
        required: String,
        found: String,
    },

    #[error("Install tree {path} is locked by another process")]
    TreeLocked { path: PathBuf },

    #[error("Destination {path} is not empty")]
    DestinationNotEmpty { path: PathBuf },

    #[error("{package} failed during {phase}: {source}")]
    Phase {
        package: String,
        phase: Phase,
        #[source]
        source: Box<PackageError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl PackageError {
    /// Wrap this error with the package and phase it occurred in.
    ///
    /// Errors that already carry a phase are left alone so the innermost
    /// package of a recursive install is the one reported.
    pub fn in_phase(self, package: impl Into<String>, phase: Phase) -> Self {
        match self {
            PackageError::Phase { .. } => self,
            other => PackageError::Phase {
                package: package.into(),
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The error underneath any phase wrappers
    pub fn root_cause(&self) -> &PackageError {
        match self {
            PackageError::Phase { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The phase this error was raised in, if it was wrapped with one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            PackageError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PackageError {
    fn from(err: reqwest::Error) -> Self {
        PackageError::NetworkError {
            message: err.to_string(),
        }
    }
}

/// Attach a phase to the error of a result
pub(crate) trait PhaseExt<T> {
    fn phase(self, package: &str, phase: Phase) -> Result<T>;
}

impl<T> PhaseExt<T> for Result<T> {
    fn phase(self, package: &str, phase: Phase) -> Result<T> {
        self.map_err(|e| e.in_phase(package, phase))
    }
}

impl<T> PhaseExt<T> for std::io::Result<T> {
    fn phase(self, package: &str, phase: Phase) -> Result<T> {
        self.map_err(|e| PackageError::from(e).in_phase(package, phase))
    }
}
