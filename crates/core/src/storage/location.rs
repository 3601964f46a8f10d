//! Resolve table location strings into a provider tag and its components.
//!
//! Supported forms:
//! - `abfss://<container>@<account>.dfs.core.windows.net/<path>` (secure transfer)
//! - `abfs://<container>@<account>.dfs.core.windows.net/<path>`
//! - `https://<account>.(dfs|blob).core.windows.net/<container>/<path>`
//! - `az://<container>/<path>`, `azure://<container>/<path>`, `adl://<container>/<path>`
//! - `s3://<bucket>/<path>`, `s3a://<bucket>/<path>`, `gs://<bucket>/<path>`
//! - `file:///<path>`, `memory:///<path>` and plain local paths
use std::fmt;
use std::path::PathBuf;

use object_store::path::Path;
use url::Url;

use crate::{DeltaResult, DeltaTableError};

const KNOWN_SCHEMES: &str = "abfss,abfs,az,azure,adl,https,s3,s3a,gs,file,memory";

/// Storage provider a table location dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageProvider {
    /// Azure storage over the secure filesystem scheme (`abfss`, `az`, `https`)
    AzureBlobSecure,
    /// Azure storage addressed through the plain filesystem scheme (`abfs`)
    AzureBlob,
    /// Azure Data Lake short form (`adl`)
    AzureAdl,
    /// Amazon S3 and compatible stores
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Local file system
    Local,
    /// Process local in-memory store
    Memory,
}

impl StorageProvider {
    /// Stable name used in logs and cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AzureBlobSecure => "azure-blob-secure",
            Self::AzureBlob => "azure-blob",
            Self::AzureAdl => "azure-adl",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Local => "local",
            Self::Memory => "memory",
        }
    }

    /// Whether the provider is one of the Azure variants
    pub fn is_azure(&self) -> bool {
        matches!(
            self,
            Self::AzureBlobSecure | Self::AzureBlob | Self::AzureAdl
        )
    }

    /// Whether requests against this provider must be authorized
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Local | Self::Memory)
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed table location. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocation {
    /// Provider the location dispatches to
    pub provider: StorageProvider,
    /// Storage account, when the location names one
    pub account: Option<String>,
    /// Container or bucket
    pub container: Option<String>,
    /// Table root relative to the container. Empty for local paths, where the
    /// root directory is carried by [`TableLocation::url`].
    pub root: Path,
    /// Normalized location url, without a trailing slash unless it is the store root
    pub url: Url,
}

impl TableLocation {
    /// Parse a location string.
    ///
    /// Pure function, no I/O. Relative local paths are made absolute against the
    /// current working directory.
    pub fn parse(location: impl AsRef<str>) -> DeltaResult<Self> {
        let location = location.as_ref().trim();
        if location.is_empty() {
            return Err(DeltaTableError::InvalidLocation(
                "table location is empty".to_string(),
            ));
        }
        match Url::parse(location) {
            Ok(url) => Self::try_from_url(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => Self::from_local_path(location),
            Err(err) => Err(DeltaTableError::InvalidLocation(format!(
                "could not parse {location} as a URL: {err}"
            ))),
        }
    }

    /// Build a location from an already parsed url
    pub fn try_from_url(url: Url) -> DeltaResult<Self> {
        let scheme = url.scheme().to_ascii_lowercase();
        match scheme.as_str() {
            "abfss" => Self::parse_abfs(url, StorageProvider::AzureBlobSecure),
            "abfs" => Self::parse_abfs(url, StorageProvider::AzureBlob),
            "az" | "azure" => Self::parse_short_form(url, StorageProvider::AzureBlobSecure),
            "adl" => Self::parse_short_form(url, StorageProvider::AzureAdl),
            "https" | "http" if is_azure_host(&url) => Self::parse_azure_https(url),
            "s3" | "s3a" => Self::parse_short_form(url, StorageProvider::S3),
            "gs" => Self::parse_short_form(url, StorageProvider::Gcs),
            "memory" => Ok(Self {
                provider: StorageProvider::Memory,
                account: None,
                container: None,
                root: Path::from_url_path(url.path())?,
                url: normalize_url(url),
            }),
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    DeltaTableError::InvalidLocation(format!("{url} is not a valid file path"))
                })?;
                Self::from_local_path(path.to_string_lossy())
            }
            // a single character scheme is a windows drive letter
            s if s.len() == 1 => Self::from_local_path(url.as_str()),
            other => Err(DeltaTableError::InvalidLocation(format!(
                "unknown scheme: {other}. Known schemes: {KNOWN_SCHEMES}"
            ))),
        }
    }

    fn from_local_path(path: impl AsRef<str>) -> DeltaResult<Self> {
        let path = PathBuf::from(path.as_ref());
        let absolute = std::path::absolute(&path).map_err(|err| {
            DeltaTableError::InvalidLocation(format!("{}: {err}", path.display()))
        })?;
        let url = Url::from_directory_path(&absolute).map_err(|_| {
            DeltaTableError::InvalidLocation(format!(
                "could not construct a URL from the path: {}",
                absolute.display()
            ))
        })?;
        Ok(Self {
            provider: StorageProvider::Local,
            account: None,
            container: None,
            root: Path::default(),
            url: normalize_url(url),
        })
    }

    /// `abfs[s]://<container>@<account>.<host>/<path>`
    fn parse_abfs(url: Url, provider: StorageProvider) -> DeltaResult<Self> {
        let container = non_empty(url.username()).ok_or_else(|| {
            DeltaTableError::InvalidLocation(format!(
                "{url}: expected <container>@<account>.dfs.core.windows.net"
            ))
        })?;
        let account = url
            .host_str()
            .and_then(|host| host.split('.').next())
            .and_then(non_empty)
            .ok_or_else(|| {
                DeltaTableError::InvalidLocation(format!("{url}: missing storage account"))
            })?;
        Ok(Self {
            provider,
            account: Some(account),
            container: Some(container),
            root: Path::from_url_path(url.path())?,
            url: normalize_url(url),
        })
    }

    /// `https://<account>.(dfs|blob).core.windows.net/<container>/<path>`
    fn parse_azure_https(url: Url) -> DeltaResult<Self> {
        let account = url
            .host_str()
            .and_then(|host| host.split('.').next())
            .and_then(non_empty)
            .ok_or_else(|| {
                DeltaTableError::InvalidLocation(format!("{url}: missing storage account"))
            })?;
        let mut segments = url.path().trim_start_matches('/').splitn(2, '/');
        let container = segments.next().and_then(non_empty).ok_or_else(|| {
            DeltaTableError::InvalidLocation(format!("{url}: missing container"))
        })?;
        let root = Path::from_url_path(segments.next().unwrap_or_default())?;
        Ok(Self {
            provider: StorageProvider::AzureBlobSecure,
            account: Some(account),
            container: Some(container),
            root,
            url: normalize_url(url),
        })
    }

    /// `<scheme>://<container-or-bucket>/<path>`
    fn parse_short_form(url: Url, provider: StorageProvider) -> DeltaResult<Self> {
        let container = url.host_str().and_then(non_empty).ok_or_else(|| {
            DeltaTableError::InvalidLocation(format!(
                "{url}: missing {}",
                if provider.is_azure() {
                    "container"
                } else {
                    "bucket"
                }
            ))
        })?;
        Ok(Self {
            provider,
            account: None,
            container: Some(container),
            root: Path::from_url_path(url.path())?,
            url: normalize_url(url),
        })
    }

    /// Directory on the local file system, for [`StorageProvider::Local`] locations.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self.provider {
            StorageProvider::Local => self.url.to_file_path().ok(),
            _ => None,
        }
    }

    /// Fully qualified uri for a path relative to the table root
    pub fn to_uri(&self, path: &Path) -> String {
        let root = self.url.as_str();
        if path.as_ref().is_empty() {
            root.to_string()
        } else if root.ends_with('/') {
            format!("{root}{path}")
        } else {
            format!("{root}/{path}")
        }
    }
}

impl fmt::Display for TableLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

fn is_azure_host(url: &Url) -> bool {
    url.host_str().is_some_and(|host| {
        host.ends_with(".dfs.core.windows.net") || host.ends_with(".blob.core.windows.net")
    })
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Trailing or redundant slashes are load bearing for [Url::join], strip them.
fn normalize_url(mut url: Url) -> Url {
    let trimmed = url.path().trim_end_matches('/').to_owned();
    // the root of a store keeps its slash
    url.set_path(if trimmed.is_empty() { "/" } else { &trimmed });
    url
}
