//! Index and shard metadata records
//!
//! Layout inside a metadata store:
//!
//! ```text
//! <index_name>/index.json        IndexMetadata (scalar fields only)
//! <index_name>/<shard_name>.json ShardMetadata, one per shard
//! ```
//!
//! A shard name is a single path component and never `index`, so a shard
//! record can neither shadow the index record nor land outside its index.

pub mod index;
pub mod shard;

pub use index::{IndexMetadata, ShardRegistry};
pub use shard::ShardMetadata;

use crate::common::{normalize_path, Error, Result};
use crate::metastore::MetadataStore;

pub const INDEX_METADATA_FILE: &str = "index.json";
const METADATA_EXT: &str = ".json";

pub fn index_metadata_path(index_name: &str) -> String {
    normalize_path(&format!("{}/{}", index_name, INDEX_METADATA_FILE))
}

/// Reject shard names that would not map to their own record under the index
pub fn validate_shard_name(shard_name: &str) -> Result<()> {
    let reserved = INDEX_METADATA_FILE.trim_end_matches(METADATA_EXT);
    if shard_name.is_empty()
        || shard_name == "."
        || shard_name == ".."
        || shard_name == reserved
        || shard_name.contains(['/', '\\'])
    {
        return Err(Error::InvalidName(format!("shard name {:?}", shard_name)));
    }
    Ok(())
}

pub fn shard_metadata_path(index_name: &str, shard_name: &str) -> Result<String> {
    validate_shard_name(shard_name)?;
    Ok(normalize_path(&format!(
        "{}/{}{}",
        index_name, shard_name, METADATA_EXT
    )))
}

/// Shard name encoded in a path listed under an index, if it is a shard record
fn shard_name_from_listing(entry: &str) -> Option<&str> {
    if entry.contains('/') || entry == INDEX_METADATA_FILE {
        return None;
    }
    entry
        .strip_suffix(METADATA_EXT)
        .filter(|name| !name.is_empty())
}

/// Write the index record and every registered shard record.
///
/// All shard names are checked before anything is written.
pub async fn save_index_metadata(store: &dyn MetadataStore, index: &IndexMetadata) -> Result<()> {
    let shards = index.all_shard_metadata();
    let mut records = Vec::with_capacity(shards.len());
    for (shard_name, shard) in &shards {
        let path = shard_metadata_path(&index.index_name, shard_name).inspect_err(|e| {
            tracing::error!(index = %index.index_name, error = %e, "refusing to save index metadata");
        })?;
        records.push((path, shard.to_bytes()?));
    }

    for (path, bytes) in records {
        store.put(&path, &bytes).await?;
    }
    store
        .put(&index_metadata_path(&index.index_name), &index.to_bytes()?)
        .await
}

/// Read the index record and repopulate its shards from per-shard records
pub async fn load_index_metadata(store: &dyn MetadataStore, index_name: &str) -> Result<IndexMetadata> {
    let index = IndexMetadata::from_bytes(&store.get(&index_metadata_path(index_name)).await?)?;

    for entry in store.list(index_name).await? {
        let Some(shard_name) = shard_name_from_listing(&entry) else {
            continue;
        };
        let bytes = match store.get(&shard_metadata_path(index_name, shard_name)?).await {
            Ok(bytes) => bytes,
            // removed between list and get
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        index.set_shard_metadata(shard_name, ShardMetadata::from_bytes(&bytes)?);
    }

    tracing::debug!(index = index_name, shards = index.num_shards(), "loaded index metadata");
    Ok(index)
}

/// Remove the index record and all of its shard records
pub async fn delete_index_metadata(store: &dyn MetadataStore, index_name: &str) -> Result<()> {
    for entry in store.list(index_name).await? {
        if let Some(shard_name) = shard_name_from_listing(&entry) {
            store.delete(&shard_metadata_path(index_name, shard_name)?).await?;
        }
    }
    store.delete(&index_metadata_path(index_name)).await
}
