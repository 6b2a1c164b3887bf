//! ppym package manager CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ppym_package::manifest::MANIFEST_FILE;
use ppym_package::publish;
use ppym_package::{
    Credentials, HttpRegistry, InstallContext, InstallOptions, Installer, LocalRegistry, Manifest,
    PackageConfig, PackageError, PackageReference, Registration, Registry, ScriptRunner,
    Uninstaller, Version,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ppym")]
#[command(about = "Package manager for nodepy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Registry URL; `file://` URLs use a registry directory on disk
    #[arg(long, env = "PPYM_REGISTRY")]
    registry: Option<String>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new package
    Init {
        /// Package name
        #[arg(long)]
        name: Option<String>,
    },

    /// Create a distribution archive in dist/
    Dist,

    /// Create an account on the registry
    Register {
        #[arg(long, env = "PPYM_USERNAME")]
        username: String,

        #[arg(long, env = "PPYM_PASSWORD", hide_env_values = true)]
        password: String,

        #[arg(long)]
        email: String,
    },

    /// Build a distribution and upload it
    Publish,

    /// Upload an existing distribution archive
    Upload {
        file: PathBuf,
    },

    /// Install packages, or the dependencies of the current package
    Install {
        /// Directories, archives or `name[@version]` references
        packages: Vec<String>,

        /// Install into the global tree
        #[arg(short, long)]
        global: bool,

        /// Link directory packages instead of copying them
        #[arg(short = 'e', long)]
        develop: bool,

        /// Re-install packages that are already installed
        #[arg(short = 'U', long)]
        upgrade: bool,

        /// Fail on conflicting version requirements
        #[arg(long)]
        strict: bool,
    },

    /// Remove installed packages
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,

        #[arg(short, long)]
        global: bool,
    },

    /// Print the bin directory
    Bin {
        #[arg(short, long)]
        global: bool,

        /// Print the bin directory of pip-installed dependencies instead
        #[arg(long)]
        pip: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let mut config = PackageConfig::load()?;
    if let Some(registry) = cli.registry {
        config.registry = registry;
    }

    let cwd = std::env::current_dir()?;
    let scripts = ScriptRunner::new(config.script_timeout());

    match cli.command {
        Commands::Init { name } => {
            init_package(&cwd, name)?;
        }

        Commands::Dist => {
            let path = publish::dist(&cwd, &scripts)?;
            println!("{}", path.display());
        }

        Commands::Register {
            username,
            password,
            email,
        } => {
            let registry = open_registry(&config)?;
            let message = registry.register(&Registration {
                username,
                password,
                email,
            })?;
            println!("{}", message);
        }

        Commands::Publish => {
            let registry = open_registry(&config)?;
            let manifest =
                publish::publish(&cwd, registry.as_ref(), &credentials(&config)?, &scripts)?;
            println!("Published {}", manifest.identifier());
        }

        Commands::Upload { file } => {
            let registry = open_registry(&config)?;
            let manifest = Manifest::from_dir(&cwd)?;
            publish::upload(&file, &manifest, registry.as_ref(), &credentials(&config)?)?;
            println!("Uploaded {}", manifest.identifier());
        }

        Commands::Install {
            packages,
            global,
            develop,
            upgrade,
            strict,
        } => {
            let registry = open_registry(&config)?;
            let installer = Installer::new(&config, registry);
            let ctx = InstallContext::from_config(&config, &cwd, global).lock(config.lock_timeout())?;
            let options = InstallOptions {
                develop,
                upgrade,
                strict,
            };

            let mut hook_failures = Vec::new();
            if packages.is_empty() {
                let manifest = Manifest::from_dir(&cwd)
                    .with_context(|| format!("no {} in {}", MANIFEST_FILE, cwd.display()))?;
                let report = installer.install_dependencies(&manifest, &cwd, &ctx, options)?;
                hook_failures.extend(report.hook_failures);
            } else {
                for package in &packages {
                    let reference = PackageReference::classify(package)?;
                    let outcome = installer.install(&reference, &ctx, options)?;
                    println!("Installed {}", outcome.record.identifier());
                    hook_failures.extend(outcome.report.hook_failures);
                }
            }
            report_hook_failures(&hook_failures)?;
        }

        Commands::Uninstall { packages, global } => {
            let uninstaller = Uninstaller::new(&config);
            let ctx = InstallContext::from_config(&config, &cwd, global).lock(config.lock_timeout())?;

            let mut hook_failures = Vec::new();
            for package in &packages {
                let outcome = uninstaller.uninstall(package, &ctx)?;
                println!("Uninstalled {}", outcome.record.identifier());
                hook_failures.extend(outcome.hook_failure);
            }
            report_hook_failures(&hook_failures)?;
        }

        Commands::Bin { global, pip } => {
            let ctx = InstallContext::from_config(&config, &cwd, global);
            if pip {
                println!("{}", ctx.pip_bin_dir().display());
            } else {
                println!("{}", ctx.bin_dir().display());
            }
        }
    }

    Ok(())
}

fn open_registry(config: &PackageConfig) -> Result<Arc<dyn Registry>> {
    if let Some(path) = config.registry.strip_prefix("file://") {
        return Ok(Arc::new(LocalRegistry::new(PathBuf::from(path))));
    }
    Ok(Arc::new(HttpRegistry::new(
        config.registry.clone(),
        config.http_timeout(),
    )?))
}

fn credentials(config: &PackageConfig) -> Result<Credentials> {
    match (&config.username, &config.password) {
        (Some(username), Some(password)) => Ok(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => bail!("no credentials: set PPYM_USERNAME and PPYM_PASSWORD or add them to the config file"),
    }
}

fn report_hook_failures(failures: &[PackageError]) -> Result<()> {
    for failure in failures {
        warn!("{}", failure);
    }
    if !failures.is_empty() {
        bail!("{} lifecycle hook(s) failed", failures.len());
    }
    Ok(())
}

fn init_package(dir: &Path, name: Option<String>) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let name = match name {
        Some(name) => name,
        None => dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("cannot derive a package name from the current directory")?,
    };

    let manifest = Manifest::new(&name, Version::new(1, 0, 0))?;
    manifest.save(&path)?;
    println!("Created {}", path.display());
    Ok(())
}
