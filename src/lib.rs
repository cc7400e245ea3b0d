//! # metacoord
//!
//! Metadata coordination for a multi-node document-indexing cluster:
//! - A pluggable metadata store (etcd or local filesystem)
//! - Watch-based change propagation from the etcd backend
//! - A distributed lock with fencing tokens, on the same etcd cluster
//! - Index/shard metadata records carried by the store
//!
//! ## Architecture
//!
//! ```text
//!  node A                                   node B
//! ┌──────────────────────┐                ┌──────────────────────┐
//! │ EtcdLock::lock()     │                │ RemoteMetadataStore  │
//! │  → fencing token     │                │  watch task          │
//! │ store.get / put      │                │  → MetastoreEvent    │
//! └─────────┬────────────┘                └─────────▲────────────┘
//!           │            ┌──────────────┐           │
//!           └───────────▶│     etcd     │───────────┘
//!                        └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use metacoord::{open_store, EtcdLock, MetadataStore, MetastoreConfig};
//!
//! # async fn run() -> metacoord::Result<()> {
//! let config = MetastoreConfig::load();
//! metacoord::common::init_tracing(&config.log_level);
//!
//! let store = open_store("etcd://cluster/metastore", &config).await?;
//! let mut lock = EtcdLock::connect_with_uri("etcd://cluster/locks/wiki", &config).await?;
//!
//! let token = lock.lock().await?;
//! store.put("wiki/index.json", br#"{"index_name":"wiki"}"#).await?;
//! lock.unlock().await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod lock;
pub mod metadata;
pub mod metastore;

// Re-export commonly used types
pub use common::{Error, MetastoreConfig, OverflowPolicy, Result};
pub use lock::etcd::EtcdLock;
pub use lock::{DistributedLock, LockState};
pub use metadata::{IndexMetadata, ShardMetadata};
pub use metastore::{
    open_store, EventKind, LocalMetadataStore, MetadataStore, Metastore, MetastoreEvent,
    RemoteMetadataStore, SchemeType,
};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
