//! Index descriptor and its shard registry

use super::shard::ShardMetadata;
use crate::common::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Shard name → descriptor, guarded for concurrent access.
///
/// Lives only in memory; never serialized.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<String, ShardMetadata>>,
}

impl ShardRegistry {
    pub fn get(&self, shard_name: &str) -> Option<ShardMetadata> {
        self.shards.read().get(shard_name).cloned()
    }

    pub fn set(&self, shard_name: impl Into<String>, shard: ShardMetadata) {
        self.shards.write().insert(shard_name.into(), shard);
    }

    pub fn delete(&self, shard_name: &str) -> Option<ShardMetadata> {
        self.shards.write().remove(shard_name)
    }

    pub fn exists(&self, shard_name: &str) -> bool {
        self.shards.read().contains_key(shard_name)
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> HashMap<String, ShardMetadata> {
        self.shards.read().clone()
    }
}

impl Clone for ShardRegistry {
    fn clone(&self) -> Self {
        Self {
            shards: RwLock::new(self.snapshot()),
        }
    }
}

/// Index descriptor.
///
/// Only the scalar fields travel over the wire; the shard registry always
/// comes back empty from [`IndexMetadata::from_bytes`] and is refilled from
/// per-shard records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index_name: String,
    pub index_uri: String,
    pub index_lock_uri: String,
    /// Owned by the mapping subsystem, carried opaquely
    #[serde(default)]
    pub index_mapping: serde_json::Value,
    #[serde(default)]
    pub index_mapping_version: i64,
    #[serde(default)]
    pub default_search_field: String,
    #[serde(skip)]
    shards: ShardRegistry,
}

impl IndexMetadata {
    pub fn new(
        index_name: impl Into<String>,
        index_uri: impl Into<String>,
        index_lock_uri: impl Into<String>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            index_uri: index_uri.into(),
            index_lock_uri: index_lock_uri.into(),
            ..Default::default()
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn all_shard_metadata(&self) -> HashMap<String, ShardMetadata> {
        self.shards.snapshot()
    }

    pub fn shard_metadata_exists(&self, shard_name: &str) -> bool {
        self.shards.exists(shard_name)
    }

    pub fn get_shard_metadata(&self, shard_name: &str) -> Option<ShardMetadata> {
        self.shards.get(shard_name)
    }

    pub fn set_shard_metadata(&self, shard_name: impl Into<String>, shard: ShardMetadata) {
        self.shards.set(shard_name, shard)
    }

    pub fn delete_shard_metadata(&self, shard_name: &str) -> Option<ShardMetadata> {
        self.shards.delete(shard_name)
    }

    /// Sorted shard names
    pub fn shard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.snapshot().into_keys().collect();
        names.sort();
        names
    }
}
