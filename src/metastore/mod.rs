//! Pluggable metadata store
//!
//! Two backends share the [`MetadataStore`] contract:
//! - [`RemoteMetadataStore`]: etcd, with a background watch task that turns
//!   key changes into [`MetastoreEvent`]s
//! - [`LocalMetadataStore`]: a directory tree on the local filesystem
//!
//! Paths are always relative to the store root and use `/` as separator, so
//! the same relative path works against either backend.

pub mod etcd;
pub mod fs;
mod watch;

pub use etcd::RemoteMetadataStore;
pub use fs::LocalMetadataStore;

use crate::common::{Error, MetastoreConfig, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Backend kinds selectable by URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemeType {
    Etcd,
    File,
}

impl SchemeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemeType::Etcd => "etcd",
            SchemeType::File => "file",
        }
    }

    /// Parse a URI and return it with its backend kind
    pub fn parse_uri(uri: &str) -> Result<(Self, Url)> {
        let url = Url::parse(uri)?;
        let scheme = url.scheme().parse()?;
        Ok((scheme, url))
    }

    /// Parse a URI, requiring this backend kind
    pub fn expect_uri(&self, uri: &str) -> Result<Url> {
        let (scheme, url) = Self::parse_uri(uri)?;
        if scheme != *self {
            return Err(Error::InvalidUri(format!(
                "expected {}:// but got {}",
                self.as_str(),
                uri
            )));
        }
        Ok(url)
    }
}

impl FromStr for SchemeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "etcd" => Ok(SchemeType::Etcd),
            "file" => Ok(SchemeType::File),
            other => Err(Error::InvalidUri(format!("unsupported scheme: {}", other))),
        }
    }
}

impl fmt::Display for SchemeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change carried by a [`MetastoreEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => write!(f, "put"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// One change observed on the coordination service.
///
/// `path` is the full key as stored by the backend (root included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetastoreEvent {
    pub kind: EventKind,
    pub path: String,
    pub value: Vec<u8>,
}

impl MetastoreEvent {
    /// Build an event from raw key/value bytes.
    ///
    /// Keys are paths and must be UTF-8.
    pub fn from_raw(kind: EventKind, key: &[u8], value: &[u8]) -> Result<Self> {
        let path = std::str::from_utf8(key)
            .map_err(|e| Error::UnsupportedEvent(format!("non UTF-8 key: {}", e)))?;
        Ok(Self {
            kind,
            path: path.to_string(),
            value: value.to_vec(),
        })
    }

    /// The event path relative to `root`, or `None` if it lies outside it
    pub fn relative_path(&self, root: &str) -> Option<&str> {
        let root = root.trim_end_matches('/');
        self.path
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

/// Common contract of every metadata backend
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Stored bytes at `path`; `NotFound` if absent
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Paths below `prefix`, relative to it. Ordering is backend specific.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create or overwrite
    async fn put(&self, path: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Never fails just because `path` is missing
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Release backend resources
    async fn close(&self) -> Result<()>;
}

/// A store opened from a URI
pub enum Metastore {
    Remote(RemoteMetadataStore),
    Local(LocalMetadataStore),
}

impl Metastore {
    pub fn scheme(&self) -> SchemeType {
        match self {
            Metastore::Remote(_) => SchemeType::Etcd,
            Metastore::Local(_) => SchemeType::File,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteMetadataStore> {
        match self {
            Metastore::Remote(store) => Some(store),
            Metastore::Local(_) => None,
        }
    }

    fn inner(&self) -> &dyn MetadataStore {
        match self {
            Metastore::Remote(store) => store,
            Metastore::Local(store) => store,
        }
    }
}

/// Open the backend selected by the URI scheme.
///
/// The scheme is validated before any connection or directory is created.
pub async fn open_store(uri: &str, config: &MetastoreConfig) -> Result<Metastore> {
    let (scheme, _) = SchemeType::parse_uri(uri).inspect_err(|e| {
        tracing::error!(uri, error = %e, "failed to open metastore");
    })?;

    match scheme {
        SchemeType::Etcd => Ok(Metastore::Remote(
            RemoteMetadataStore::connect_with_uri(uri, config).await?,
        )),
        SchemeType::File => Ok(Metastore::Local(
            LocalMetadataStore::open_with_uri(uri).await?,
        )),
    }
}

#[async_trait]
impl MetadataStore for Metastore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.inner().get(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner().list(prefix).await
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        self.inner().put(path, value).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner().delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner().exists(path).await
    }

    async fn close(&self) -> Result<()> {
        self.inner().close().await
    }
}
