//! Package registry operations

use crate::archive::{archive_name, read_manifest_labeled};
use crate::version::highest_matching;
use crate::{Manifest, PackageError, Result, Version, VersionReq};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Package metadata in registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,

    /// User that first published the package; only they may upload to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    pub versions: Vec<PackageVersion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<Version>,
}

/// Version-specific package information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersion {
    pub version: Version,

    /// Archive file name
    pub archive: String,

    /// SHA256 checksum of the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default)]
    pub dependencies: HashMap<String, String>,

    pub published_at: DateTime<Utc>,

    #[serde(default)]
    pub size: u64,
}

/// Login for authenticated registry calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A new registry account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl Registration {
    /// Reject obviously malformed accounts before they reach the registry
    pub fn validate(&self) -> Result<()> {
        let username_ok = self.username.len() >= 3
            && self
                .username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !username_ok {
            return Err(PackageError::ValidationError {
                message: format!(
                    "username '{}' must be at least 3 characters of [A-Za-z0-9._-]",
                    self.username
                ),
            });
        }
        if self.password.len() < 6 {
            return Err(PackageError::ValidationError {
                message: "password must be at least 6 characters".to_string(),
            });
        }
        match self.email.split_once('@') {
            Some((user, domain)) if !user.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(PackageError::ValidationError {
                message: format!("'{}' is not an e-mail address", self.email),
            }),
        }
    }
}

/// Registry trait for different registry implementations
pub trait Registry: Send + Sync {
    /// Highest published version satisfying `req`.
    ///
    /// An unknown package and an unreachable registry both yield
    /// [`PackageError::PackageNotFound`].
    fn resolve_version(&self, name: &str, req: &VersionReq) -> Result<Version>;

    /// Metadata of one published version
    fn package_version(&self, name: &str, version: &Version) -> Result<PackageVersion>;

    /// All published versions, oldest first
    fn versions(&self, name: &str) -> Result<Vec<Version>>;

    /// Archive bytes of a published version
    fn download(&self, name: &str, version: &Version) -> Result<Vec<u8>>;

    /// Publish an archive for `manifest`; never overwrites an existing version
    fn upload(&self, archive: &[u8], manifest: &Manifest, credentials: &Credentials) -> Result<()>;

    /// Create an account, returning the registry's confirmation message
    fn register(&self, registration: &Registration) -> Result<String>;
}

/// Hex SHA256 of some bytes
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check that an archive really holds the package version being uploaded
pub fn validate_upload(archive: &[u8], manifest: &Manifest) -> Result<Manifest> {
    let label = archive_name(&manifest.name, &manifest.version);
    let embedded = read_manifest_labeled(archive, &label)?;

    if embedded.name != manifest.name {
        return Err(PackageError::ValidationError {
            message: format!(
                "archive contains package '{}', expected '{}'",
                embedded.name, manifest.name
            ),
        });
    }
    if embedded.version != manifest.version {
        return Err(PackageError::VersionMismatch {
            package: manifest.name.clone(),
            expected: manifest.version.to_string(),
            found: embedded.version.to_string(),
        });
    }
    Ok(embedded)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDb {
    users: HashMap<String, UserEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    password_sha256: String,
    email: String,
}

fn password_digest(username: &str, password: &str) -> String {
    checksum(format!("{}:{}", username, password).as_bytes())
}

/// Local file-based registry
pub struct LocalRegistry {
    path: PathBuf,
}

impl LocalRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn package_path(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.path.join("packages"), |dir, part| dir.join(part))
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.package_path(name).join("metadata.json")
    }

    fn users_path(&self) -> PathBuf {
        self.path.join("users.json")
    }

    /// Get package metadata
    pub fn get_package(&self, name: &str) -> Result<Package> {
        let metadata_path = self.metadata_path(name);
        if !metadata_path.exists() {
            return Err(PackageError::PackageNotFound {
                name: name.to_string(),
                version: "*".to_string(),
            });
        }

        let content = fs::read_to_string(&metadata_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn load_users(&self) -> Result<UserDb> {
        let path = self.users_path();
        if !path.exists() {
            return Ok(UserDb::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let users = self.load_users()?;
        let expected = users
            .users
            .get(&credentials.username)
            .map(|u| u.password_sha256.as_str());
        if expected != Some(password_digest(&credentials.username, &credentials.password).as_str())
        {
            return Err(PackageError::AuthError {
                message: format!("invalid credentials for '{}'", credentials.username),
            });
        }
        Ok(())
    }
}

impl Registry for LocalRegistry {
    fn resolve_version(&self, name: &str, req: &VersionReq) -> Result<Version> {
        let package = self.get_package(name)?;
        highest_matching(package.versions.iter().map(|v| &v.version), req).ok_or_else(|| {
            PackageError::PackageNotFound {
                name: name.to_string(),
                version: req.to_string(),
            }
        })
    }

    fn package_version(&self, name: &str, version: &Version) -> Result<PackageVersion> {
        let package = self.get_package(name)?;

        package
            .versions
            .into_iter()
            .find(|v| &v.version == version)
            .ok_or_else(|| PackageError::PackageNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    fn versions(&self, name: &str) -> Result<Vec<Version>> {
        let mut versions: Vec<_> = self
            .get_package(name)?
            .versions
            .into_iter()
            .map(|v| v.version)
            .collect();
        versions.sort();
        Ok(versions)
    }

    fn download(&self, name: &str, version: &Version) -> Result<Vec<u8>> {
        let info = self.package_version(name, version)?;
        let bytes = fs::read(self.package_path(name).join(&info.archive)).map_err(|_| {
            PackageError::PackageNotFound {
                name: name.to_string(),
                version: version.to_string(),
            }
        })?;

        if let Some(expected) = info.checksum {
            let actual = checksum(&bytes);
            if actual != expected {
                return Err(PackageError::ChecksumMismatch {
                    package: format!("{}@{}", name, version),
                    expected,
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    fn upload(&self, archive: &[u8], manifest: &Manifest, credentials: &Credentials) -> Result<()> {
        self.authenticate(credentials)?;
        validate_upload(archive, manifest)?;

        let mut package = match self.get_package(&manifest.name) {
            Ok(existing) => existing,
            Err(PackageError::PackageNotFound { .. }) => Package {
                name: manifest.name.clone(),
                owner: Some(credentials.username.clone()),
                versions: Vec::new(),
                latest: None,
            },
            Err(e) => return Err(e),
        };

        if let Some(owner) = &package.owner {
            if owner != &credentials.username {
                return Err(PackageError::AuthError {
                    message: format!("'{}' is owned by '{}'", manifest.name, owner),
                });
            }
        }
        if package.versions.iter().any(|v| v.version == manifest.version) {
            return Err(PackageError::ConflictError {
                package: manifest.name.clone(),
                version: manifest.version.to_string(),
            });
        }

        let package_dir = self.package_path(&manifest.name);
        fs::create_dir_all(&package_dir)?;
        let file_name = archive_name(&manifest.name, &manifest.version);
        fs::write(package_dir.join(&file_name), archive)?;

        package.versions.push(PackageVersion {
            version: manifest.version.clone(),
            archive: file_name,
            checksum: Some(checksum(archive)),
            dependencies: manifest.dependencies.clone(),
            published_at: Utc::now(),
            size: archive.len() as u64,
        });
        package.latest = package.versions.iter().map(|v| &v.version).max().cloned();

        fs::write(
            self.metadata_path(&manifest.name),
            serde_json::to_string_pretty(&package)?,
        )?;
        info!("Published {}", manifest.identifier());
        Ok(())
    }

    fn register(&self, registration: &Registration) -> Result<String> {
        registration.validate()?;

        let mut users = self.load_users()?;
        if users.users.contains_key(&registration.username) {
            return Err(PackageError::AlreadyExists {
                username: registration.username.clone(),
            });
        }

        users.users.insert(
            registration.username.clone(),
            UserEntry {
                password_sha256: password_digest(&registration.username, &registration.password),
                email: registration.email.clone(),
            },
        );
        fs::create_dir_all(&self.path)?;
        fs::write(self.users_path(), serde_json::to_string_pretty(&users)?)?;
        Ok(format!("User '{}' registered", registration.username))
    }
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    name: String,
    version: Version,
}

/// HTTP-based registry client
pub struct HttpRegistry {
    base_url: String,
    client: Client,
}

impl HttpRegistry {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    /// `{base}/api/<segments...>` with each segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| PackageError::NetworkError {
            message: format!("invalid registry url '{}': {}", self.base_url, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| PackageError::NetworkError {
                message: format!("registry url '{}' cannot have a path", self.base_url),
            })?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn error_text(response: Response) -> String {
        let status = response.status();
        match response.text() {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => status.to_string(),
        }
    }
}

impl Registry for HttpRegistry {
    fn resolve_version(&self, name: &str, req: &VersionReq) -> Result<Version> {
        let not_found = || PackageError::PackageNotFound {
            name: name.to_string(),
            version: req.to_string(),
        };

        let url = self.url(&["find", name, req.as_str()])?;
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(e) => {
                debug!("Registry unreachable while resolving {}: {}", name, e);
                return Err(not_found());
            }
        };
        if !response.status().is_success() {
            debug!("Registry answered {} for {}@{}", response.status(), name, req);
            return Err(not_found());
        }

        let found: FindResponse = response.json().map_err(|_| not_found())?;
        if found.name != name || !req.matches(&found.version) {
            return Err(not_found());
        }
        Ok(found.version)
    }

    fn package_version(&self, name: &str, version: &Version) -> Result<PackageVersion> {
        let url = self.url(&["package", name, &version.to_string()])?;
        let response = self.client.get(url).send()?;

        match response.status() {
            status if status.is_success() => Ok(response.json()?),
            StatusCode::NOT_FOUND => Err(PackageError::PackageNotFound {
                name: name.to_string(),
                version: version.to_string(),
            }),
            _ => Err(PackageError::NetworkError {
                message: Self::error_text(response),
            }),
        }
    }

    fn versions(&self, name: &str) -> Result<Vec<Version>> {
        let url = self.url(&["package", name])?;
        let response = self.client.get(url).send()?;

        match response.status() {
            status if status.is_success() => {
                let package: Package = response.json()?;
                let mut versions: Vec<_> = package.versions.into_iter().map(|v| v.version).collect();
                versions.sort();
                Ok(versions)
            }
            StatusCode::NOT_FOUND => Err(PackageError::PackageNotFound {
                name: name.to_string(),
                version: "*".to_string(),
            }),
            _ => Err(PackageError::NetworkError {
                message: Self::error_text(response),
            }),
        }
    }

    fn download(&self, name: &str, version: &Version) -> Result<Vec<u8>> {
        let info = self.package_version(name, version)?;
        let url = self.url(&["download", name, &version.to_string(), &info.archive])?;
        let response = self.client.get(url).send()?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(PackageError::PackageNotFound {
                    name: name.to_string(),
                    version: version.to_string(),
                })
            }
            _ => {
                return Err(PackageError::NetworkError {
                    message: Self::error_text(response),
                })
            }
        }

        let bytes = response.bytes()?.to_vec();
        if let Some(expected) = info.checksum {
            let actual = checksum(&bytes);
            if actual != expected {
                return Err(PackageError::ChecksumMismatch {
                    package: format!("{}@{}", name, version),
                    expected,
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    fn upload(&self, archive: &[u8], manifest: &Manifest, credentials: &Credentials) -> Result<()> {
        let version = manifest.version.to_string();
        let file_name = archive_name(&manifest.name, &manifest.version);
        let url = self.url(&["upload", &manifest.name, &version, &file_name])?;

        let response = self
            .client
            .put(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .body(archive.to_vec())
            .send()?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Err(PackageError::VersionMismatch {
                package: manifest.name.clone(),
                expected: version,
                found: Self::error_text(response),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PackageError::AuthError {
                message: Self::error_text(response),
            }),
            StatusCode::CONFLICT => Err(PackageError::ConflictError {
                package: manifest.name.clone(),
                version,
            }),
            _ => Err(PackageError::NetworkError {
                message: Self::error_text(response),
            }),
        }
    }

    fn register(&self, registration: &Registration) -> Result<String> {
        let url = self.url(&["register"])?;
        let response = self.client.post(url).json(registration).send()?;

        match response.status() {
            status if status.is_success() => Ok(Self::error_text(response)),
            StatusCode::CONFLICT => Err(PackageError::AlreadyExists {
                username: registration.username.clone(),
            }),
            StatusCode::BAD_REQUEST => Err(PackageError::ValidationError {
                message: Self::error_text(response),
            }),
            _ => Err(PackageError::NetworkError {
                message: Self::error_text(response),
            }),
        }
    }
}

/// Read an archive file for upload
pub fn read_archive(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PackageError::PackageNotFound {
            name: path.display().to_string(),
            version: "*".to_string(),
        },
        _ => PackageError::Io(e),
    })
}
