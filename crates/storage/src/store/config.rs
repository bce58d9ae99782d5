#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DB_FILE_NAME: &str = "lix.db";
pub const DEFAULT_MAX_INHERITANCE_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub storage_dir: PathBuf,
    pub db_file_name: String,
    pub busy_timeout: Duration,
    pub max_inheritance_depth: usize,
    /// When off, every state read resolves the change graph directly.
    pub cache_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".lix"),
            db_file_name: DEFAULT_DB_FILE_NAME.to_string(),
            busy_timeout: Duration::from_secs(5),
            max_inheritance_depth: DEFAULT_MAX_INHERITANCE_DEPTH,
            cache_enabled: true,
        }
    }
}

impl StoreConfig {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `LIX_STORAGE_DIR`, `LIX_BUSY_TIMEOUT_MS` and `LIX_CACHE_DISABLED`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("LIX_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                config.storage_dir = PathBuf::from(dir);
            }
        }
        if let Some(ms) = std::env::var("LIX_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
        {
            config.busy_timeout = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("LIX_CACHE_DISABLED") {
            config.cache_enabled = !matches!(raw.trim(), "1" | "true" | "yes");
        }
        config
    }

    pub fn with_db_file_name(mut self, name: impl Into<String>) -> Self {
        self.db_file_name = name.into();
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_max_inheritance_depth(mut self, depth: usize) -> Self {
        self.max_inheritance_depth = depth;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(&self.db_file_name)
    }
}
