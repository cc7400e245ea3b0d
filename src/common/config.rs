//! Configuration for metacoord components

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::common::{Error, Result};

/// File looked up (without extension) by [`MetastoreConfig::load`]
pub const DEFAULT_CONFIG_FILE: &str = "metacoord";

/// Environment prefix, e.g. `METACOORD_REQUEST_TIMEOUT_MS=5000`
pub const ENV_PREFIX: &str = "METACOORD";

/// What the watch loop does when the event channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to make room (backpressure)
    #[default]
    Block,
    /// Discard the event that does not fit
    DropNewest,
}

/// Settings shared by the metadata stores and the distributed lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetastoreConfig {
    /// Deadline for every remote request
    pub request_timeout_ms: u64,

    /// Capacity of the watch event channel
    pub event_channel_capacity: usize,

    /// Behaviour on a full event channel
    pub overflow_policy: OverflowPolicy,

    /// Coordination service endpoints, used when the URI names none
    pub etcd_endpoints: Vec<String>,

    /// Lease TTL backing a lock session
    pub session_ttl_secs: i64,

    /// Logging level
    pub log_level: String,
}

impl Default for MetastoreConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3_000,
            event_channel_capacity: 10,
            overflow_policy: OverflowPolicy::Block,
            etcd_endpoints: vec!["localhost:2379".to_string()],
            session_ttl_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl MetastoreConfig {
    /// Load `metacoord.toml` from the working directory if present, then apply
    /// `METACOORD_*` environment overrides. Falls back to defaults.
    pub fn load() -> Self {
        match Self::build(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load configuration, using defaults");
                Self::default()
            }
        }
    }

    /// Load from an explicit TOML file (required), then environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: MetastoreConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("etcd_endpoints"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values no store can run with
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("request_timeout_ms must be > 0".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        if self.session_ttl_secs <= 0 {
            return Err(Error::InvalidConfig("session_ttl_secs must be > 0".into()));
        }
        if self.etcd_endpoints.is_empty() {
            return Err(Error::InvalidConfig("etcd_endpoints is empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
