//! Store configuration
//!
//! Environment:
//! - STORE_BACKEND: `memory` or `jsonl` (default `jsonl`)
//! - STORE_DATA_DIR: JSONL data directory (default `./data`)
//! - STORE_ATTACHMENTS_DIR: attachment files (default `<data dir>/attachments`)
//! - STORE_DELETION_MODE: `keep-everything`, `keep-authors` or `keep-nothing`
//! - STORE_HISTORY: keep history rows (`true`/`false`, default `false`)
//! - STORE_STREAM_CACHE_TTL_SECS: stream tree cache TTL; unset for write-through
//! - STORE_STREAM_HIGH_WATER_MARK: events buffered ahead of streaming readers

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::policy::DeletionMode;
use crate::store::{CachePolicy, EventStoreSettings, DEFAULT_HIGH_WATER_MARK};

/// Which document backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    #[default]
    Jsonl,
}

/// Configuration of a [`DataStore`](crate::DataStore)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub attachments_dir: Option<PathBuf>,
    pub deletion_mode: DeletionMode,
    pub history: bool,
    pub stream_cache_ttl_secs: Option<u64>,
    pub high_water_mark: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            data_dir: PathBuf::from("data"),
            attachments_dir: None,
            deletion_mode: DeletionMode::default(),
            history: false,
            stream_cache_ttl_secs: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl StoreConfig {
    /// Volatile store, for tests; attachments still need a directory
    pub fn in_memory<P: AsRef<Path>>(attachments_dir: P) -> Self {
        Self {
            backend: BackendKind::Memory,
            attachments_dir: Some(attachments_dir.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// JSONL store rooted at `data_dir`
    pub fn jsonl<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            backend: BackendKind::Jsonl,
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_deletion_mode(mut self, mode: DeletionMode) -> Self {
        self.deletion_mode = mode;
        self
    }

    pub fn with_history(mut self, history: bool) -> Self {
        self.history = history;
        self
    }

    pub fn with_stream_cache_ttl(mut self, ttl: Duration) -> Self {
        self.stream_cache_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Read the configuration from `STORE_*` environment variables
    pub fn from_env() -> StoreResult<Self> {
        let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::from_lookup(|key| env::var(key).ok(), &current_dir)
    }

    /// Build from an arbitrary variable source; relative paths resolve against `base_dir`
    pub fn from_lookup<F>(lookup: F, base_dir: &Path) -> StoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(backend) = lookup("STORE_BACKEND") {
            config.backend = match backend.trim() {
                "memory" => BackendKind::Memory,
                "jsonl" => BackendKind::Jsonl,
                other => return Err(invalid("STORE_BACKEND", other)),
            };
        }
        config.data_dir = resolve(
            base_dir,
            lookup("STORE_DATA_DIR").map(PathBuf::from).unwrap_or(config.data_dir),
        );
        config.attachments_dir = lookup("STORE_ATTACHMENTS_DIR").map(|p| resolve(base_dir, PathBuf::from(p)));
        if let Some(mode) = lookup("STORE_DELETION_MODE") {
            config.deletion_mode = mode.trim().parse()?;
        }
        if let Some(history) = lookup("STORE_HISTORY") {
            config.history = match history.trim() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => return Err(invalid("STORE_HISTORY", other)),
            };
        }
        if let Some(ttl) = lookup("STORE_STREAM_CACHE_TTL_SECS") {
            config.stream_cache_ttl_secs =
                Some(ttl.trim().parse().map_err(|_| invalid("STORE_STREAM_CACHE_TTL_SECS", &ttl))?);
        }
        if let Some(mark) = lookup("STORE_STREAM_HIGH_WATER_MARK") {
            config.high_water_mark = mark
                .trim()
                .parse()
                .map_err(|_| invalid("STORE_STREAM_HIGH_WATER_MARK", &mark))?;
        }
        Ok(config)
    }

    pub fn attachments_path(&self) -> PathBuf {
        self.attachments_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attachments"))
    }

    pub fn cache_policy(&self) -> CachePolicy {
        match self.stream_cache_ttl_secs {
            Some(secs) => CachePolicy::Ttl(Duration::from_secs(secs)),
            None => CachePolicy::WriteThrough,
        }
    }

    pub fn event_settings(&self) -> EventStoreSettings {
        EventStoreSettings {
            deletion_mode: self.deletion_mode,
            history: self.history,
            high_water_mark: self.high_water_mark.max(1),
        }
    }
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn invalid(key: &str, value: &str) -> StoreError {
    StoreError::InvalidOperation(format!("invalid value '{}' for {}", value, key))
}
