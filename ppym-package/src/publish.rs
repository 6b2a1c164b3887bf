//! Building distributions and publishing them to a registry

use crate::archive::{archive_name, write_archive};
use crate::manifest::LifecycleEvent;
use crate::registry::{read_archive, Credentials};
use crate::scripts::ScriptRunner;
use crate::{Manifest, Registry, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Directory distributions are written to, relative to the package
pub const DIST_DIR: &str = "dist";

/// Pack the package in `dir` into `dir/dist`, running its dist hooks.
///
/// Returns the path of the written archive.
pub fn dist(dir: &Path, scripts: &ScriptRunner) -> Result<PathBuf> {
    let manifest = Manifest::from_dir(dir)?;
    scripts.run_checked(&manifest, LifecycleEvent::PreDist, dir, &[])?;

    // pre-dist may rewrite the manifest
    let manifest = Manifest::from_dir(dir)?;
    let path = write_archive(dir, &manifest, &dir.join(DIST_DIR))?;
    info!("Created {}", path.display());

    scripts.run_checked(&manifest, LifecycleEvent::PostDist, dir, &[])?;
    Ok(path)
}

/// Build a distribution of `dir` and upload it, running the publish hooks
pub fn publish(
    dir: &Path,
    registry: &dyn Registry,
    credentials: &Credentials,
    scripts: &ScriptRunner,
) -> Result<Manifest> {
    let manifest = Manifest::from_dir(dir)?;
    scripts.run_checked(&manifest, LifecycleEvent::PrePublish, dir, &[])?;

    let archive = dist(dir, scripts)?;
    let manifest = Manifest::from_dir(dir)?;
    upload(&archive, &manifest, registry, credentials)?;

    scripts.run_checked(&manifest, LifecycleEvent::PostPublish, dir, &[])?;
    Ok(manifest)
}

/// Upload an existing archive as the package version in `manifest`
pub fn upload(
    archive: &Path,
    manifest: &Manifest,
    registry: &dyn Registry,
    credentials: &Credentials,
) -> Result<()> {
    let expected = archive_name(&manifest.name, &manifest.version);
    let actual = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if actual != expected {
        warn!("Uploading {} as {}", actual, expected);
    }

    let bytes = read_archive(archive)?;
    info!(
        "Uploading {} ({} bytes) as {}",
        manifest.identifier(),
        bytes.len(),
        credentials.username
    );
    registry.upload(&bytes, manifest, credentials)
}
