//! etcd-backed metadata store
//!
//! Keys live in a flat namespace under `root + "/" + relative_path`. Every
//! request runs under the configured deadline. A watch task, started with
//! [`RemoteMetadataStore::start`], forwards every change at or below the root
//! to a bounded event channel.

use super::watch::{
    WatchBatch, WatchLoop, WatchSource, WatchSubscription, WatchedEvent, WATCH_RETRY_BACKOFF,
};
use super::{EventKind, MetadataStore, MetastoreEvent, SchemeType};
use crate::common::{join_root, strip_prefix_path, Error, MetastoreConfig, OverflowPolicy, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, DeleteOptions, EventType, GetOptions, SortOrder, SortTarget, WatchOptions, WatchStream,
    Watcher,
};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Endpoints named in the URI query, e.g. `?endpoints=etcd-0:2379,etcd-1:2379`
pub(crate) fn endpoints_from_uri(url: &Url, config: &MetastoreConfig) -> Vec<String> {
    let from_uri: Vec<String> = url
        .query_pairs()
        .filter(|(k, _)| k == "endpoints")
        .flat_map(|(_, v)| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect();

    if from_uri.is_empty() {
        config.etcd_endpoints.clone()
    } else {
        from_uri
    }
}

/// Coordination key root named by `etcd://host/path`, without trailing slash
pub(crate) fn root_from_uri(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    join_root(&format!("/{}", host), url.path())
        .trim_end_matches('/')
        .to_string()
}

/// Connect under a deadline; failure to reach the backend is returned, never fatal
pub(crate) async fn connect(endpoints: &[String], timeout: Duration) -> Result<Client> {
    match tokio::time::timeout(timeout, Client::connect(endpoints, None)).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => {
            tracing::error!(target: "metastore::etcd", endpoints = ?endpoints, error = %e, "failed to connect to etcd");
            Err(e.into())
        }
        Err(_) => {
            tracing::error!(target: "metastore::etcd", endpoints = ?endpoints, "timed out connecting to etcd");
            Err(Error::Timeout(format!("connect {}", endpoints.join(","))))
        }
    }
}

/// Run one etcd request under `timeout`, logging failures with their context
pub(crate) async fn request<T, F>(op: &str, key: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, etcd_client::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!(target: "metastore::etcd", op, key, error = %e, "etcd request failed");
            Err(e.into())
        }
        Err(_) => {
            tracing::error!(target: "metastore::etcd", op, key, timeout_ms = timeout.as_millis() as u64, "etcd request timed out");
            Err(Error::Timeout(format!("{} {}", op, key)))
        }
    }
}

/// Translate one watch notification
pub fn convert_event(event: &etcd_client::Event) -> Result<MetastoreEvent> {
    translate_event(event.event_type(), event.kv().map(|kv| (kv.key(), kv.value())))
}

fn translate_event(event_type: EventType, kv: Option<(&[u8], &[u8])>) -> Result<MetastoreEvent> {
    let (key, value) =
        kv.ok_or_else(|| Error::UnsupportedEvent("event without key-value".into()))?;

    #[allow(unreachable_patterns)]
    let kind = match event_type {
        EventType::Put => EventKind::Put,
        EventType::Delete => EventKind::Delete,
        other => {
            return Err(Error::UnsupportedEvent(format!("event type {:?}", other)));
        }
    };

    MetastoreEvent::from_raw(kind, key, value)
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Metadata store backed by etcd
pub struct RemoteMetadataStore {
    client: RwLock<Option<Client>>,
    root: String,
    request_timeout: Duration,
    overflow_policy: OverflowPolicy,
    events_tx: mpsc::Sender<MetastoreEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<MetastoreEvent>>>,
    watcher: tokio::sync::Mutex<Option<WatchTask>>,
    dropped_events: Arc<AtomicU64>,
}

impl RemoteMetadataStore {
    /// Connect from `etcd://host/path[?endpoints=...]`.
    ///
    /// The key root is `/host/path`. The scheme is checked before connecting.
    pub async fn connect_with_uri(uri: &str, config: &MetastoreConfig) -> Result<Self> {
        let url = SchemeType::Etcd.expect_uri(uri).inspect_err(|e| {
            tracing::error!(target: "metastore::etcd", uri, error = %e, "invalid metastore uri");
        })?;
        config.validate()?;

        let endpoints = endpoints_from_uri(&url, config);
        let client = connect(&endpoints, config.request_timeout()).await?;

        Ok(Self::with_client(client, root_from_uri(&url), config))
    }

    /// Wrap an already connected client
    pub fn with_client(client: Client, root: impl Into<String>, config: &MetastoreConfig) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));

        tracing::debug!(target: "metastore::etcd", root = %root, "opened etcd metastore");

        Self {
            client: RwLock::new(Some(client)),
            root,
            request_timeout: config.request_timeout(),
            overflow_policy: config.overflow_policy,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            watcher: tokio::sync::Mutex::new(None),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Hand out the event receiver. Only the first call gets it.
    ///
    /// Until it is taken and drained, a `Block` policy stalls the watch task
    /// once the channel is full.
    pub fn take_events(&self) -> Option<mpsc::Receiver<MetastoreEvent>> {
        self.events_rx.lock().take()
    }

    /// Events discarded under [`OverflowPolicy::DropNewest`]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub async fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    fn client(&self) -> Result<Client> {
        self.client.read().clone().ok_or_else(|| {
            tracing::error!(target: "metastore::etcd", root = %self.root, "metastore is closed");
            Error::Closed
        })
    }

    fn make_path(&self, path: &str) -> String {
        join_root(&self.root, path)
    }

    /// Spawn the watch task
    pub async fn start(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        if watcher.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Err(Error::Other("watcher already running".into()));
        }

        let client = self.client()?;
        let cancel = CancellationToken::new();
        let watch = WatchLoop {
            source: EtcdWatchSource { client },
            prefix: format!("{}/", self.root),
            events: self.events_tx.clone(),
            overflow_policy: self.overflow_policy,
            dropped_events: self.dropped_events.clone(),
            cancel: cancel.clone(),
            backoff: WATCH_RETRY_BACKOFF,
        };

        let handle = tokio::spawn(watch.run());
        *watcher = Some(WatchTask { cancel, handle });

        tracing::info!(target: "metastore::etcd", root = %self.root, "watch started");
        Ok(())
    }

    /// Cancel the watch task and wait for it to exit.
    ///
    /// No event is sent after this returns.
    pub async fn stop(&self) -> Result<()> {
        let task = self.watcher.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::error!(target: "metastore::etcd", error = %e, "watch task panicked");
            return Err(Error::Other(format!("watch task failed: {}", e)));
        }

        tracing::info!(target: "metastore::etcd", root = %self.root, "watch stopped");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RemoteMetadataStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.make_path(path);
        let mut client = self.client()?;

        let resp = request("get", &key, self.request_timeout, client.get(key.as_str(), None)).await?;

        match resp.kvs().first() {
            Some(kv) => Ok(kv.value().to_vec()),
            None => {
                tracing::debug!(target: "metastore::etcd", op = "get", key = %key, "key does not exist");
                Err(Error::NotFound(path.to_string()))
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefix_key = self.make_path(prefix);
        if !prefix_key.ends_with('/') {
            prefix_key.push('/');
        }
        let mut client = self.client()?;

        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend)
            .with_keys_only();
        let resp = request(
            "list",
            &prefix_key,
            self.request_timeout,
            client.get(prefix_key.as_str(), Some(options)),
        )
        .await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                let key = String::from_utf8_lossy(kv.key());
                strip_prefix_path(&key, &prefix_key).to_string()
            })
            .collect())
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let key = self.make_path(path);
        let mut client = self.client()?;

        request(
            "put",
            &key,
            self.request_timeout,
            client.put(key.as_str(), value, None),
        )
        .await?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.make_path(path);
        let mut client = self.client()?;

        request(
            "delete",
            &key,
            self.request_timeout,
            client.delete(key.as_str(), None::<DeleteOptions>),
        )
        .await?;

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.make_path(path);
        let mut client = self.client()?;

        let resp = request(
            "exists",
            &key,
            self.request_timeout,
            client.get(key.as_str(), Some(GetOptions::new().with_count_only())),
        )
        .await?;

        Ok(resp.count() > 0)
    }

    /// Stops the watcher first, then drops the client.
    async fn close(&self) -> Result<()> {
        let stopped = self.stop().await;
        if self.client.write().take().is_some() {
            tracing::info!(target: "metastore::etcd", root = %self.root, "etcd metastore closed");
        }
        stopped
    }
}

/// etcd side of the watch loop
pub(crate) struct EtcdWatchSource {
    client: Client,
}

pub(crate) struct EtcdSubscription {
    watcher: Watcher,
    stream: WatchStream,
}

#[async_trait]
impl WatchSource for EtcdWatchSource {
    type Subscription = EtcdSubscription;

    async fn subscribe(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<EtcdSubscription> {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, stream) = self.client.watch(prefix, Some(options)).await?;
        Ok(EtcdSubscription { watcher, stream })
    }
}

#[async_trait]
impl WatchSubscription for EtcdSubscription {
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>> {
        let Some(resp) = self.stream.message().await? else {
            return Ok(None);
        };

        if resp.canceled() {
            return Ok(Some(WatchBatch::Canceled {
                compact_revision: resp.compact_revision(),
                reason: resp.cancel_reason().to_string(),
            }));
        }

        Ok(Some(WatchBatch::Events(
            resp.events()
                .iter()
                .map(|event| WatchedEvent {
                    revision: event.kv().map(|kv| kv.mod_revision()),
                    event: convert_event(event),
                })
                .collect(),
        )))
    }

    async fn cancel(&mut self) {
        if let Err(e) = self.watcher.cancel().await {
            tracing::debug!(target: "metastore::etcd", error = %e, "failed to cancel watch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_from_uri() {
        let url = Url::parse("etcd://cluster/meta").unwrap();
        assert_eq!(root_from_uri(&url), "/cluster/meta");

        let url = Url::parse("etcd://cluster/meta/").unwrap();
        assert_eq!(root_from_uri(&url), "/cluster/meta");

        let url = Url::parse("etcd://cluster").unwrap();
        assert_eq!(root_from_uri(&url), "/cluster");
    }

    #[test]
    fn test_endpoints_from_uri() {
        let config = MetastoreConfig::default();

        let url = Url::parse("etcd://cluster/meta?endpoints=etcd-0:2379,etcd-1:2379").unwrap();
        assert_eq!(
            endpoints_from_uri(&url, &config),
            vec!["etcd-0:2379", "etcd-1:2379"]
        );

        let url = Url::parse("etcd://cluster/meta").unwrap();
        assert_eq!(endpoints_from_uri(&url, &config), config.etcd_endpoints);
    }

    #[tokio::test]
    async fn test_connect_with_uri_rejects_scheme() {
        let err = RemoteMetadataStore::connect_with_uri("file:///tmp/meta", &MetastoreConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[test]
    fn test_translate_event() {
        let event = translate_event(EventType::Put, Some((&b"/cluster/meta/a"[..], &b"{}"[..]))).unwrap();
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.path, "/cluster/meta/a");
        assert_eq!(event.value, b"{}");

        let event = translate_event(EventType::Delete, Some((&b"/cluster/meta/a"[..], &b""[..]))).unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.value.is_empty());
    }

    #[test]
    fn test_translate_event_unsupported() {
        assert!(matches!(
            translate_event(EventType::Put, None),
            Err(Error::UnsupportedEvent(_))
        ));
        assert!(matches!(
            translate_event(EventType::Put, Some((&[0xff, 0xfe][..], &b"{}"[..]))),
            Err(Error::UnsupportedEvent(_))
        ));
    }
}
