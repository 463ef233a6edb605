//! Store configuration loaded from environment variables.
//!
//! All settings have defaults so the store opens with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use outpost_shared::constants::{DEFAULT_CHUNK_RETENTION_HOURS, MAX_CHUNK_SIZE};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the database file and the device key.
    /// Env: `OUTPOST_DATA_DIR`
    /// Default: the platform data directory (see [`crate::Database::new`]).
    pub data_dir: Option<PathBuf>,

    /// SQLite journal mode. The authoritative copy can always be re-fetched
    /// from the server, so durability is traded for throughput.
    /// Env: `OUTPOST_JOURNAL_MODE`
    /// Default: `MEMORY`
    pub journal_mode: String,

    /// SQLite `synchronous` pragma.
    /// Env: `OUTPOST_SYNCHRONOUS`
    /// Default: `OFF`
    pub synchronous: String,

    /// How long SQLite waits on a locked database before reporting busy.
    /// Env: `OUTPOST_BUSY_TIMEOUT_MS`
    /// Default: `5000`
    pub busy_timeout: Duration,

    /// Age after which incomplete upload chunks are garbage-collected.
    /// Env: `OUTPOST_CHUNK_RETENTION_HOURS`
    /// Default: `24`
    pub chunk_retention: chrono::Duration,

    /// Maximum size of one base64 upload fragment.
    /// Env: `OUTPOST_MAX_CHUNK_BYTES`
    /// Default: 4 MiB
    pub max_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            journal_mode: "MEMORY".to_string(),
            synchronous: "OFF".to_string(),
            busy_timeout: Duration::from_millis(5000),
            chunk_retention: chrono::Duration::hours(DEFAULT_CHUNK_RETENTION_HOURS),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("OUTPOST_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(mode) = lookup("OUTPOST_JOURNAL_MODE") {
            match normalize_journal_mode(&mode) {
                Some(mode) => config.journal_mode = mode,
                None => tracing::warn!(value = %mode, "Invalid OUTPOST_JOURNAL_MODE, using default"),
            }
        }

        if let Some(sync) = lookup("OUTPOST_SYNCHRONOUS") {
            let upper = sync.trim().to_uppercase();
            if ["OFF", "NORMAL", "FULL", "EXTRA"].contains(&upper.as_str()) {
                config.synchronous = upper;
            } else {
                tracing::warn!(value = %sync, "Invalid OUTPOST_SYNCHRONOUS, using default");
            }
        }

        if let Some(val) = lookup("OUTPOST_BUSY_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.busy_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %val, "Invalid OUTPOST_BUSY_TIMEOUT_MS, using default"),
            }
        }

        if let Some(val) = lookup("OUTPOST_CHUNK_RETENTION_HOURS") {
            match val.parse::<i64>() {
                Ok(hours) if hours > 0 => config.chunk_retention = chrono::Duration::hours(hours),
                _ => tracing::warn!(value = %val, "Invalid OUTPOST_CHUNK_RETENTION_HOURS, using default"),
            }
        }

        if let Some(val) = lookup("OUTPOST_MAX_CHUNK_BYTES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_chunk_size = n,
                _ => tracing::warn!(value = %val, "Invalid OUTPOST_MAX_CHUNK_BYTES, using default"),
            }
        }

        config
    }
}

fn normalize_journal_mode(mode: &str) -> Option<String> {
    let upper = mode.trim().to_uppercase();
    match upper.as_str() {
        "DELETE" | "TRUNCATE" | "PERSIST" | "MEMORY" | "WAL" | "OFF" => Some(upper),
        _ => None,
    }
}
