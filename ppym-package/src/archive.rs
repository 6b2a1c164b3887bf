//! Distribution archives: `<name>-<version>.tar.gz` packing and unpacking

use crate::manifest::MANIFEST_FILE;
use crate::{Manifest, PackageError, Result, Version};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use glob::Pattern;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Patterns never shipped in a distribution
pub const DEFAULT_EXCLUDES: [&str; 9] = [
    ".DS_Store",
    ".svn/*",
    ".git",
    ".git/*",
    "nodepy_modules/*",
    "*.pyc",
    "*.pyo",
    "dist/*",
    ".ppym-record.json",
];

/// Deterministic archive file name for a package version.
///
/// Scoped names are flattened: `@scope/foo` becomes `scope-foo`.
pub fn archive_name(name: &str, version: &Version) -> String {
    let flat = name.trim_start_matches('@').replace('/', "-");
    format!("{}-{}.tar.gz", flat, version)
}

/// A file selected for distribution
#[derive(Debug, Clone)]
pub struct PackageFile {
    pub path: PathBuf,
    /// Path relative to the package root, `/`-separated
    pub relative: String,
}

/// List the files of a package directory that belong in a distribution.
///
/// The manifest is always included. Other files are dropped when they match
/// an exclude pattern, and, if include patterns are declared, kept only when
/// they match one of those.
pub fn package_files(dir: &Path, manifest: &Manifest) -> Result<Vec<PackageFile>> {
    let includes = compile_patterns(&manifest.dist.include_files)?;
    let mut excludes = compile_patterns(&manifest.dist.exclude_files)?;
    excludes.extend(compile_patterns(&DEFAULT_EXCLUDES)?);

    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let rel = relative_path(dir, entry.path());
            !matches_any(&excludes, &format!("{}/", rel))
        });

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = relative_path(dir, entry.path());
        let keep = relative == MANIFEST_FILE
            || (!matches_any(&excludes, &relative)
                && (includes.is_empty() || matches_any(&includes, &relative)));

        if keep {
            files.push(PackageFile {
                path: entry.path().to_path_buf(),
                relative,
            });
        }
    }

    Ok(files)
}

fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p.as_ref()).map_err(|e| PackageError::InvalidManifest {
                origin: MANIFEST_FILE.to_string(),
                message: format!("Invalid file pattern '{}': {}", p.as_ref(), e),
            })
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    patterns.iter().any(|p| p.matches(path))
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pack a package directory into gzip-compressed tar bytes.
///
/// Entries are sorted and carry a zero mtime so the same tree always packs
/// to the same bytes.
pub fn pack(dir: &Path, manifest: &Manifest) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut wrote_manifest = false;

    for file in package_files(dir, manifest)? {
        let mut data = fs::read(&file.path)?;
        if file.relative == MANIFEST_FILE {
            // Ship the manifest we validated, not whatever is on disk now
            if Manifest::parse(&data).ok().as_ref() != Some(manifest) {
                data = manifest.to_json()?.into_bytes();
            }
            wrote_manifest = true;
        }
        append_file(&mut builder, &file.relative, &data, file_mode(&file.path)?)?;
    }

    if !wrote_manifest {
        let data = manifest.to_json()?.into_bytes();
        append_file(&mut builder, MANIFEST_FILE, &data, 0o644)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    relative: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    builder.append_data(&mut header, relative, data)?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

/// Pack a package into `out_dir`, returning the path of the written archive
pub fn write_archive(dir: &Path, manifest: &Manifest, out_dir: &Path) -> Result<PathBuf> {
    let bytes = pack(dir, manifest)?;
    fs::create_dir_all(out_dir)?;
    let path = out_dir.join(archive_name(&manifest.name, &manifest.version));
    fs::write(&path, bytes)?;
    Ok(path)
}

/// Read the embedded manifest of an archive without extracting it
pub fn read_manifest(bytes: &[u8]) -> Result<Manifest> {
    read_manifest_labeled(bytes, "<memory>")
}

pub(crate) fn read_manifest_labeled(bytes: &[u8], label: &str) -> Result<Manifest> {
    let corrupt = |message: String| PackageError::CorruptArchive {
        archive: label.to_string(),
        message,
    };

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut nested: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(|e| corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        let path = entry.path().map_err(|e| corrupt(e.to_string()))?.into_owned();
        let components: Vec<_> = path.components().collect();
        let is_manifest = path.file_name().map(|n| n == MANIFEST_FILE).unwrap_or(false);
        if !is_manifest || components.len() > 2 {
            continue;
        }

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| corrupt(e.to_string()))?;
        if components.len() == 1 {
            return Manifest::parse(&data).map_err(|e| corrupt(e.to_string()));
        }
        nested.get_or_insert(data);
    }

    match nested {
        Some(data) => Manifest::parse(&data).map_err(|e| corrupt(e.to_string())),
        None => Err(corrupt(format!("archive contains no {}", MANIFEST_FILE))),
    }
}

/// Unpack archive bytes into `dest`, which must be missing or empty.
///
/// The archive is extracted next to `dest` first and only renamed into place
/// once its manifest parsed, so a failure never leaves files at `dest`.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<Manifest> {
    unpack_labeled(bytes, dest, "<memory>")
}

/// Unpack an archive file into `dest`
pub fn unpack_file(archive: &Path, dest: &Path) -> Result<Manifest> {
    let bytes = fs::read(archive).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PackageError::PackageNotFound {
            name: archive.display().to_string(),
            version: "*".to_string(),
        },
        _ => PackageError::Io(e),
    })?;
    unpack_labeled(&bytes, dest, &archive.display().to_string())
}

fn unpack_labeled(bytes: &[u8], dest: &Path, label: &str) -> Result<Manifest> {
    if dest.exists() && fs::read_dir(dest)?.next().is_some() {
        return Err(PackageError::DestinationNotEmpty {
            path: dest.to_path_buf(),
        });
    }

    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".ppym-unpack-")
        .tempdir_in(&parent)?;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(true);
    archive
        .unpack(staging.path())
        .map_err(|e| PackageError::CorruptArchive {
            archive: label.to_string(),
            message: e.to_string(),
        })?;

    let root = package_root(staging.path()).ok_or_else(|| PackageError::CorruptArchive {
        archive: label.to_string(),
        message: format!("archive contains no {}", MANIFEST_FILE),
    })?;
    let manifest = Manifest::from_dir(&root).map_err(|e| PackageError::CorruptArchive {
        archive: label.to_string(),
        message: e.to_string(),
    })?;

    if dest.exists() {
        fs::remove_dir(dest)?;
    }
    if root == staging.path() {
        let staged = staging.into_path();
        fs::rename(&staged, dest)?;
    } else {
        fs::rename(&root, dest)?;
    }

    debug!("Unpacked {} into {}", manifest.identifier(), dest.display());
    Ok(manifest)
}

/// The directory holding the manifest: the extraction root or its only child
fn package_root(extracted: &Path) -> Option<PathBuf> {
    if extracted.join(MANIFEST_FILE).is_file() {
        return Some(extracted.to_path_buf());
    }

    let mut children = fs::read_dir(extracted).ok()?.flatten();
    let only = children.next()?;
    if children.next().is_some() {
        return None;
    }
    let path = only.path();
    (path.is_dir() && path.join(MANIFEST_FILE).is_file()).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sample_package(root: &Path) -> Manifest {
        let manifest = Manifest::parse(
            br#"{"name": "@scope/foo", "version": "1.0.0", "bin": {"foo": "./bin/foo.script"}}"#,
        )
        .unwrap();
        manifest.save(&root.join(MANIFEST_FILE)).unwrap();
        write(root, "index.py", "print('hi')\n");
        write(root, "bin/foo.script", "import index\n");
        write(root, "lib/util/strings.py", "X = 1\n");
        write(root, "nodepy_modules/bar/nodepy.json", "{}");
        write(root, ".git/HEAD", "ref: refs/heads/main\n");
        write(root, "cache.pyc", "\0");
        write(root, "dist/old.tar.gz", "");
        manifest
    }

    #[test]
    fn test_archive_name() {
        let version = Version::new(1, 0, 0);
        assert_eq!(archive_name("foo", &version), "foo-1.0.0.tar.gz");
        assert_eq!(archive_name("@scope/foo", &version), "scope-foo-1.0.0.tar.gz");
    }

    #[test]
    fn test_package_files_excludes_defaults() {
        let temp = TempDir::new().unwrap();
        let manifest = sample_package(temp.path());

        let files: Vec<String> = package_files(temp.path(), &manifest)
            .unwrap()
            .into_iter()
            .map(|f| f.relative)
            .collect();

        assert_eq!(
            files,
            vec!["bin/foo.script", "index.py", "lib/util/strings.py", "nodepy.json"]
        );
    }

    #[test]
    fn test_include_patterns() {
        let temp = TempDir::new().unwrap();
        let mut manifest = sample_package(temp.path());
        manifest.dist.include_files = vec!["bin/*".to_string()];

        let files: Vec<String> = package_files(temp.path(), &manifest)
            .unwrap()
            .into_iter()
            .map(|f| f.relative)
            .collect();
        assert_eq!(files, vec!["bin/foo.script", "nodepy.json"]);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let src = TempDir::new().unwrap();
        let manifest = sample_package(src.path());

        let bytes = pack(src.path(), &manifest).unwrap();
        assert_eq!(read_manifest(&bytes).unwrap(), manifest);

        let out = TempDir::new().unwrap();
        let dest = out.path().join("foo");
        let unpacked = unpack(&bytes, &dest).unwrap();

        assert_eq!(unpacked, manifest);
        for rel in ["index.py", "bin/foo.script", "lib/util/strings.py"] {
            assert_eq!(
                fs::read(src.path().join(rel)).unwrap(),
                fs::read(dest.join(rel)).unwrap(),
                "{} differs",
                rel
            );
        }
        assert!(!dest.join("nodepy_modules").exists());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn test_pack_is_deterministic() {
        let src = TempDir::new().unwrap();
        let manifest = sample_package(src.path());
        assert_eq!(
            pack(src.path(), &manifest).unwrap(),
            pack(src.path(), &manifest).unwrap()
        );
    }

    #[test]
    fn test_corrupt_archive_leaves_nothing() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("foo");

        let err = unpack(b"definitely not gzip", &dest).unwrap_err();
        assert!(matches!(err, PackageError::CorruptArchive { .. }));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_archive_without_manifest_is_corrupt() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_file(&mut builder, "README", b"hello", 0o644).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let out = TempDir::new().unwrap();
        let dest = out.path().join("foo");
        let err = unpack(&bytes, &dest).unwrap_err();
        assert!(matches!(err, PackageError::CorruptArchive { .. }));
        assert!(!dest.exists());
        assert!(read_manifest(&bytes).is_err());
    }

    #[test]
    fn test_unpack_into_non_empty_destination() {
        let src = TempDir::new().unwrap();
        let manifest = sample_package(src.path());
        let bytes = pack(src.path(), &manifest).unwrap();

        let out = TempDir::new().unwrap();
        write(out.path(), "foo/existing.txt", "keep");
        let err = unpack(&bytes, &out.path().join("foo")).unwrap_err();
        assert!(matches!(err, PackageError::DestinationNotEmpty { .. }));
        assert!(out.path().join("foo/existing.txt").exists());
    }

    #[test]
    fn test_write_archive_names_file() {
        let src = TempDir::new().unwrap();
        let manifest = sample_package(src.path());
        let out = TempDir::new().unwrap();

        let path = write_archive(src.path(), &manifest, out.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "scope-foo-1.0.0.tar.gz");
        assert_eq!(read_manifest(&fs::read(path).unwrap()).unwrap(), manifest);
    }
}
