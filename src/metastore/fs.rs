//! Local filesystem metadata store
//!
//! Each relative path maps to one file under the root directory. A single
//! instance-wide read/write lock serializes operations: reads share it,
//! writes take it exclusively.

use super::{MetadataStore, SchemeType};
use crate::common::{normalize_path, timestamp_now_nanos, Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Filesystem-backed store
pub struct LocalMetadataStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl LocalMetadataStore {
    /// Open a store from `file:///abs/path`
    pub async fn open_with_uri(uri: &str) -> Result<Self> {
        let url = SchemeType::File.expect_uri(uri).inspect_err(|e| {
            tracing::error!(target: "metastore::fs", uri, error = %e, "invalid metastore uri");
        })?;

        let path = url.to_file_path().map_err(|_| {
            tracing::error!(target: "metastore::fs", uri, "uri does not name a local path");
            Error::InvalidUri(format!("not a local path: {}", uri))
        })?;

        Self::open(path).await
    }

    /// Open or create a store rooted at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        let exists = tokio::fs::try_exists(&root).await.inspect_err(|e| {
            tracing::error!(target: "metastore::fs", op = "open", path = %root.display(), error = %e, "failed to inspect root");
        })?;
        if !exists {
            create_dir_all(&root).await.inspect_err(|e| {
                tracing::error!(target: "metastore::fs", path = %root.display(), error = %e, "failed to create root");
            })?;
        }

        tracing::debug!(target: "metastore::fs", path = %root.display(), "opened local metastore");

        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn make_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for segment in normalize_path(path).split('/').filter(|s| !s.is_empty()) {
            full.push(segment);
        }
        full
    }

    /// Everything below `dir` in pre-order, siblings sorted by name.
    ///
    /// A missing or non-directory `dir` yields nothing.
    async fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(Vec::new()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path.clone());
                }
                found.push(path);
            }
        }

        // Component-wise ordering is pre-order traversal order.
        found.sort();
        Ok(found)
    }

    fn relative(&self, base: &Path, path: &Path) -> String {
        let rel = path.strip_prefix(base).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(unix)]
async fn create_dir_all(path: &Path) -> std::io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .await
}

#[cfg(not(unix))]
async fn create_dir_all(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

async fn write_file(path: &Path, value: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, timestamp_now_nanos()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);

    let result = async {
        let mut file = options.open(&tmp).await?;
        file.write_all(value).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[async_trait]
impl MetadataStore for LocalMetadataStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.read().await;
        let full_path = self.make_path(path);

        match tokio::fs::read(&full_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(target: "metastore::fs", op = "get", path = %full_path.display(), "path does not exist");
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => {
                tracing::error!(target: "metastore::fs", op = "get", path = %full_path.display(), error = %e, "failed to read file");
                Err(e.into())
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read().await;
        let prefix_path = self.make_path(prefix);

        let paths = Self::walk(&prefix_path).await.inspect_err(|e| {
            tracing::error!(target: "metastore::fs", op = "list", prefix = %prefix_path.display(), error = %e, "failed to walk directory");
        })?;

        Ok(paths
            .iter()
            .map(|p| self.relative(&prefix_path, p))
            .collect())
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let _guard = self.lock.write().await;
        let full_path = self.make_path(path);

        tracing::info!(target: "metastore::fs", op = "put", path = %full_path.display(), "put");

        if let Some(dir) = full_path.parent() {
            create_dir_all(dir).await.inspect_err(|e| {
                tracing::error!(target: "metastore::fs", op = "put", path = %dir.display(), error = %e, "failed to create directory");
            })?;
        }

        write_file(&full_path, value).await.inspect_err(|e| {
            tracing::error!(target: "metastore::fs", op = "put", path = %full_path.display(), error = %e, "failed to write file");
        })?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let full_path = self.make_path(path);

        tracing::info!(target: "metastore::fs", op = "delete", path = %full_path.display(), "delete");

        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::error!(target: "metastore::fs", op = "delete", path = %full_path.display(), "path does not exist");
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => {
                tracing::error!(target: "metastore::fs", op = "delete", path = %full_path.display(), error = %e, "failed to remove file");
                Err(e.into())
            }
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let _guard = self.lock.read().await;
        let full_path = self.make_path(path);

        let exists = tokio::fs::try_exists(&full_path).await.inspect_err(|e| {
            tracing::error!(target: "metastore::fs", op = "exists", path = %full_path.display(), error = %e, "failed to check path");
        })?;
        Ok(exists)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Log lines written while the returned guard is alive on this thread
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).to_string()
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path()).await.unwrap();

        store.put("hello.txt", b"hello").await.unwrap();
        assert_eq!(store.get("hello.txt").await.unwrap(), b"hello");
        assert!(store.exists("hello.txt").await.unwrap());

        store.put("hello.txt", b"world").await.unwrap();
        assert_eq!(store.get("hello.txt").await.unwrap(), b"world");

        store.delete("hello.txt").await.unwrap();
        assert!(matches!(
            store.get("hello.txt").await,
            Err(Error::NotFound(_))
        ));
        assert!(!store.exists("hello.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_errors_are_logged() {
        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path()).await.unwrap();

        let logs = CapturedLogs::default();
        let _guard = logs.install();

        // a NUL byte makes the lookup itself fail instead of reporting absence
        assert!(matches!(store.exists("bad\0name").await, Err(Error::Io(_))));
        assert!(matches!(
            LocalMetadataStore::open(dir.path().join("bad\0root")).await,
            Err(Error::Io(_))
        ));

        let text = logs.text();
        assert!(text.contains("op=\"exists\""), "{}", text);
        assert!(text.contains("op=\"open\""), "{}", text);
    }

    #[tokio::test]
    async fn test_put_creates_directories() {
        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path().join("meta")).await.unwrap();

        store.put("idx/shards/shard0.json", b"{}").await.unwrap();
        assert!(dir.path().join("meta/idx/shards/shard0.json").is_file());
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.delete("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_relative_and_ordered() {
        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path()).await.unwrap();

        store.put("a/y", b"2").await.unwrap();
        store.put("a/x", b"1").await.unwrap();
        store.put("a/sub/z", b"3").await.unwrap();
        store.put("b/w", b"4").await.unwrap();

        let paths = store.list("a").await.unwrap();
        assert_eq!(paths, vec!["sub", "sub/z", "x", "y"]);

        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backslash_paths() {
        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path()).await.unwrap();

        store.put("idx\\index.json", b"{}").await.unwrap();
        assert_eq!(store.get("idx/index.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_concurrent_puts() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalMetadataStore::open(dir.path()).await.unwrap());

        let value_a = vec![b'a'; 64 * 1024];
        let value_b = vec![b'b'; 64 * 1024];

        let (ra, rb) = tokio::join!(
            {
                let store = store.clone();
                let value = value_a.clone();
                async move { store.put("idx/a.json", &value).await }
            },
            {
                let store = store.clone();
                let value = value_b.clone();
                async move { store.put("idx/b.json", &value).await }
            }
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(store.get("idx/a.json").await.unwrap(), value_a);
        assert_eq!(store.get("idx/b.json").await.unwrap(), value_b);
        // no temp files left behind
        assert_eq!(store.list("idx").await.unwrap(), vec!["a.json", "b.json"]);
    }

    #[tokio::test]
    async fn test_open_with_uri() {
        let dir = tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("meta").display());
        let store = LocalMetadataStore::open_with_uri(&uri).await.unwrap();
        assert!(store.root().is_dir());

        assert!(matches!(
            LocalMetadataStore::open_with_uri("etcd://cluster/meta").await,
            Err(Error::InvalidUri(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = LocalMetadataStore::open(dir.path()).await.unwrap();
        store.put("secret.json", b"{}").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("secret.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
