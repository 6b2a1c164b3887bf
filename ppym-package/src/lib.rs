//! ppym package manager
//!
//! This crate installs, uninstalls and publishes nodepy packages, including:
//! - Package manifest (nodepy.json) handling
//! - Distribution archives (`<name>-<version>.tar.gz`)
//! - Package registry operations (local and remote)
//! - Dependency resolution with semantic versioning
//! - Lifecycle scripts and bin proxies
//! - CLI tools for package operations

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod installer;
pub mod linker;
pub mod manifest;
pub mod native;
pub mod publish;
pub mod record;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod scripts;
pub mod uninstaller;
pub mod version;

pub use config::PackageConfig;
pub use context::InstallContext;
pub use error::{PackageError, Phase, Result};
pub use installer::{InstallOptions, InstallOutcome, InstallReport, Installer};
pub use linker::BinLinker;
pub use manifest::{LifecycleEvent, Manifest};
pub use native::{NativeDependencyInstaller, PipInstaller};
pub use record::{InstalledPackageRecord, RecordStore};
pub use reference::{PackageReference, SourceKind};
pub use registry::{Credentials, HttpRegistry, LocalRegistry, Registration, Registry};
pub use resolver::{DependencyResolver, ResolvedDependency};
pub use scripts::{ScriptRunner, ScriptStatus};
pub use uninstaller::{UninstallOutcome, Uninstaller};
pub use version::{Version, VersionReq};
