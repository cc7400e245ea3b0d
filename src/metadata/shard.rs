//! Shard descriptor

use crate::common::{timestamp_now_nanos, Result};
use serde::{Deserialize, Serialize};

/// Where a shard lives and which lock guards it.
///
/// A plain value: share it across threads only behind your own
/// synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub shard_name: String,
    pub shard_uri: String,
    pub shard_lock_uri: String,
    /// Nanoseconds since the Unix epoch of the last update
    #[serde(rename = "shard_update_timestamp")]
    pub shard_version: i64,
}

impl ShardMetadata {
    pub fn new(
        shard_name: impl Into<String>,
        shard_uri: impl Into<String>,
        shard_lock_uri: impl Into<String>,
    ) -> Self {
        Self {
            shard_name: shard_name.into(),
            shard_uri: shard_uri.into(),
            shard_lock_uri: shard_lock_uri.into(),
            shard_version: timestamp_now_nanos(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Bump the version to now (never backwards)
    pub fn touch(&mut self) {
        self.shard_version = timestamp_now_nanos().max(self.shard_version.saturating_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_field_names() {
        let shard = ShardMetadata {
            shard_name: "shard0".into(),
            shard_uri: "s3://bucket/idx/shard0".into(),
            shard_lock_uri: "etcd://cluster/locks/idx/shard0".into(),
            shard_version: 42,
        };

        let value: serde_json::Value = serde_json::from_slice(&shard.to_bytes().unwrap()).unwrap();
        assert_eq!(value["shard_name"], "shard0");
        assert_eq!(value["shard_uri"], "s3://bucket/idx/shard0");
        assert_eq!(value["shard_lock_uri"], "etcd://cluster/locks/idx/shard0");
        assert_eq!(value["shard_update_timestamp"], 42);

        assert_eq!(ShardMetadata::from_bytes(&shard.to_bytes().unwrap()).unwrap(), shard);
    }

    #[test]
    fn test_touch_moves_forward() {
        let mut shard = ShardMetadata::new("shard0", "file:///tmp/shard0", "");
        let before = shard.shard_version;
        shard.touch();
        assert!(shard.shard_version > before);

        shard.shard_version = i64::MAX - 1;
        shard.touch();
        assert_eq!(shard.shard_version, i64::MAX);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(ShardMetadata::from_bytes(b"not json").is_err());
    }
}
