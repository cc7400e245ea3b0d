//! Common utilities and types shared across metacoord

pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

pub use config::{MetastoreConfig, OverflowPolicy};
pub use error::{Error, Result};
pub use logging::init_tracing;
pub use utils::{join_root, normalize_path, strip_prefix_path, timestamp_now_nanos};
