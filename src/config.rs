//! Server configuration, loaded from an optional file with defaults for
//! every key. No environment variables are consulted.

use crate::error::Result;

use serde::Deserialize;

/// Server and store settings.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path of the data file.
    pub path: String,
    /// Recency cache capacity, in entries. Must be positive.
    pub cache_capacity: usize,
    /// TCP address to listen on.
    pub listen: String,
    /// Logging level: error, warn, info, debug, or trace.
    pub log_level: String,
}

impl Config {
    /// Loads the configuration from the given file, which may be absent.
    pub fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("path", "bitstore/bitstore.db")?
            .set_default("cache_capacity", 1000_i64)?
            .set_default("listen", "0.0.0.0:9640")?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file).required(false))
            .build()?
            .try_deserialize()?)
    }
}
