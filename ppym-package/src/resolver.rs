//! Dependency resolution with version constraints

use crate::archive::read_manifest_labeled;
use crate::manifest::is_path_like;
use crate::reference::SourceKind;
use crate::{Manifest, PackageError, PackageReference, Registry, Result, Version, VersionReq};
use rustc_hash::FxHashMap;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolved dependency information
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDependency {
    /// Package name
    pub name: String,

    /// Resolved version
    pub version: Version,

    /// Where to acquire it from
    pub reference: PackageReference,

    /// Whether this is a direct dependency
    pub direct: bool,

    /// Names of the package's own dependencies
    pub dependencies: Vec<String>,
}

impl ResolvedDependency {
    pub fn source(&self) -> SourceKind {
        self.reference.kind()
    }

    pub fn identifier(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// What a dependency resolves to before its own dependencies are expanded
struct Lookup {
    name: String,
    version: Version,
    dependencies: HashMap<String, String>,
    /// Directory that path-like dependencies are relative to
    base_dir: Option<PathBuf>,
}

struct Pending {
    /// Name declared by the depending manifest, if any
    declared: Option<String>,
    reference: PackageReference,
    direct: bool,
}

/// Dependency resolver.
///
/// Traverses breadth-first. The first resolution of a name wins: a later,
/// conflicting requirement is logged and ignored, or rejected with
/// [`PackageError::VersionConflict`] in strict mode.
pub struct DependencyResolver {
    /// Registry to use for resolution
    registry: Arc<dyn Registry>,

    strict: bool,

    /// Registry lookups, by name and requirement
    cache: FxHashMap<(String, String), Version>,
}

impl DependencyResolver {
    /// Create a new dependency resolver
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            strict: false,
            cache: FxHashMap::default(),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Resolve the transitive dependencies of a manifest located in `base_dir`.
    ///
    /// The manifest itself is not part of the result.
    pub fn resolve(&mut self, manifest: &Manifest, base_dir: &Path) -> Result<Vec<ResolvedDependency>> {
        let queue = dependency_queue(&manifest.dependencies, Some(base_dir), true)?;
        self.expand(queue)
    }

    /// Resolve a reference together with its transitive dependencies.
    ///
    /// The referenced package comes first in the result.
    pub fn resolve_reference(&mut self, reference: &PackageReference) -> Result<Vec<ResolvedDependency>> {
        let mut queue = VecDeque::new();
        queue.push_back(Pending {
            declared: None,
            reference: reference.clone(),
            direct: true,
        });
        self.expand(queue)
    }

    fn expand(&mut self, mut queue: VecDeque<Pending>) -> Result<Vec<ResolvedDependency>> {
        let mut resolved: Vec<ResolvedDependency> = Vec::new();
        let mut index: FxHashMap<String, usize> = FxHashMap::default();

        while let Some(pending) = queue.pop_front() {
            if let Some(name) = &pending.declared {
                if let Some(&i) = index.get(name) {
                    self.check_compatible(&resolved[i], &pending.reference)?;
                    continue;
                }
            }

            let lookup = self.lookup(&pending)?;
            if let Some(&i) = index.get(&lookup.name) {
                self.check_compatible(&resolved[i], &pending.reference)?;
                continue;
            }
            debug!("Resolved {} to version {}", lookup.name, lookup.version);

            queue.extend(dependency_queue(
                &lookup.dependencies,
                lookup.base_dir.as_deref(),
                false,
            )?);

            let mut dependencies: Vec<_> = lookup.dependencies.keys().cloned().collect();
            dependencies.sort();

            let reference = match pending.reference {
                PackageReference::Registry { name, .. } => PackageReference::Registry {
                    name,
                    req: VersionReq::exact(&lookup.version),
                },
                other => other,
            };

            index.insert(lookup.name.clone(), resolved.len());
            resolved.push(ResolvedDependency {
                name: lookup.name,
                version: lookup.version,
                reference,
                direct: pending.direct,
                dependencies,
            });
        }

        Ok(resolved)
    }

    fn lookup(&mut self, pending: &Pending) -> Result<Lookup> {
        let lookup = match &pending.reference {
            PackageReference::Registry { name, req } => {
                let version = self.find_best_version(name, req)?;
                let info = self.registry.package_version(name, &version)?;
                Lookup {
                    name: name.clone(),
                    version,
                    dependencies: info.dependencies,
                    base_dir: None,
                }
            }
            PackageReference::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(PackageError::PackageNotFound {
                        name: dir.display().to_string(),
                        version: "*".to_string(),
                    });
                }
                let manifest = Manifest::from_dir(dir)?;
                Lookup {
                    name: manifest.name,
                    version: manifest.version,
                    dependencies: manifest.dependencies,
                    base_dir: Some(dir.clone()),
                }
            }
            PackageReference::Archive(path) => {
                let bytes = fs::read(path).map_err(|_| PackageError::PackageNotFound {
                    name: path.display().to_string(),
                    version: "*".to_string(),
                })?;
                let manifest = read_manifest_labeled(&bytes, &path.display().to_string())?;
                Lookup {
                    name: manifest.name,
                    version: manifest.version,
                    dependencies: manifest.dependencies,
                    base_dir: path.parent().map(Path::to_path_buf),
                }
            }
        };

        if let Some(declared) = &pending.declared {
            if declared != &lookup.name {
                return Err(PackageError::InvalidReference {
                    reference: pending.reference.to_string(),
                    message: format!(
                        "declared as '{}' but contains package '{}'",
                        declared, lookup.name
                    ),
                });
            }
        }
        Ok(lookup)
    }

    /// Find the best matching version for a package
    fn find_best_version(&mut self, name: &str, req: &VersionReq) -> Result<Version> {
        let key = (name.to_string(), req.to_string());
        if let Some(version) = self.cache.get(&key) {
            return Ok(version.clone());
        }

        let version = self.registry.resolve_version(name, req)?;
        self.cache.insert(key, version.clone());
        Ok(version)
    }

    fn check_compatible(&self, existing: &ResolvedDependency, requested: &PackageReference) -> Result<()> {
        let PackageReference::Registry { req, .. } = requested else {
            return Ok(());
        };
        if req.matches(&existing.version) {
            return Ok(());
        }

        if self.strict {
            return Err(PackageError::VersionConflict {
                package: existing.name.clone(),
                required: req.to_string(),
                found: existing.version.to_string(),
            });
        }
        warn!(
            "{} requested as {}, keeping already resolved {}",
            existing.name, req, existing.version
        );
        Ok(())
    }
}

/// Queue the dependencies of one manifest, sorted by name
fn dependency_queue(
    dependencies: &HashMap<String, String>,
    base_dir: Option<&Path>,
    direct: bool,
) -> Result<VecDeque<Pending>> {
    let mut names: Vec<_> = dependencies.keys().collect();
    names.sort();

    names
        .into_iter()
        .map(|name| -> Result<Pending> {
            let value = &dependencies[name];
            let reference = match base_dir {
                Some(base) => PackageReference::for_dependency(name, value, base)?,
                None if is_path_like(value) => {
                    return Err(PackageError::InvalidReference {
                        reference: value.clone(),
                        message: format!(
                            "path dependency '{}' of a registry package cannot be resolved",
                            name
                        ),
                    })
                }
                None => PackageReference::Registry {
                    name: name.clone(),
                    req: VersionReq::parse(value)?,
                },
            };
            Ok(Pending {
                declared: Some(name.clone()),
                reference,
                direct,
            })
        })
        .collect()
}
