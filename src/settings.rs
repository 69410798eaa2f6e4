//! Layered configuration.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. A TOML file (`--config`, or `chanwatch.toml` in the working directory
//!    when present)
//! 3. Environment variables prefixed `CHANWATCH__`, sections separated by
//!    `__` (e.g. `CHANWATCH__WATCH__BACKGROUND_ENABLED=true`)

use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::backoff::{BackoffTable, DEFAULT_BACKGROUND_FLOOR_SECS, DEFAULT_BACKOFF_SECS, MAX_WAIT_SECS};
use crate::errors::{Error, Result};
use crate::target::WatchTarget;

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    /// Targets pinned at startup, as `board/no` or `board`.
    pub pins: Vec<String>,
    pub watch: WatchSettings,
    pub source: SourceSettings,
    pub storage: StorageSettings,
}

/// Options the coordinator reacts to at runtime.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchSettings {
    /// Master switch for pin polling.
    pub enabled: bool,
    /// Keep polling while the front-end is not focused.
    pub background_enabled: bool,
    pub foreground_interval_ms: u64,
    pub background_interval_ms: u64,
    /// Backoff steps in seconds, non-decreasing.
    pub backoff_secs: Vec<u64>,
    pub background_floor_secs: u64,
    /// Released watchers kept for quick re-attachment.
    pub cache_capacity: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            background_enabled: false,
            foreground_interval_ms: 15_000,
            background_interval_ms: 15 * 60 * 1000,
            backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
            background_floor_secs: DEFAULT_BACKGROUND_FLOOR_SECS,
            cache_capacity: 25,
        }
    }
}

impl WatchSettings {
    pub fn foreground_interval(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.foreground_interval_ms as i64)
    }

    pub fn background_interval(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.background_interval_ms as i64)
    }

    pub fn backoff_table(&self) -> Result<BackoffTable> {
        BackoffTable::new(&self.backoff_secs, self.background_floor_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.backoff_table()?;
        if self.foreground_interval_ms == 0 || self.background_interval_ms == 0 {
            return Err(Error::InvalidSettings("poll intervals must be non-zero".into()));
        }
        let max_ms = MAX_WAIT_SECS * 1000;
        if self.foreground_interval_ms > max_ms || self.background_interval_ms > max_ms {
            return Err(Error::InvalidSettings(format!(
                "poll intervals must not exceed {max_ms} ms"
            )));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidSettings("cache_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceSettings {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Post numbers the viewer authored.
    pub saved_replies: Vec<u64>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://a.4cdn.org".into(),
            user_agent: concat!("chanwatch/", env!("CARGO_PKG_VERSION")).into(),
            timeout_ms: 10_000,
            saved_replies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageSettings {
    pub cache_dir: Option<PathBuf>,
}

impl StorageSettings {
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("chanwatch"),
        }
    }
}

impl Settings {
    /// Load and validate settings.
    ///
    /// `path` must exist when given; without it, `chanwatch.toml` in the
    /// working directory is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(p) => builder.add_source(File::from(p).required(true)),
            None => builder.add_source(File::with_name("chanwatch").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("CHANWATCH")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.watch.validate()?;
        self.pin_targets()?;
        Ok(())
    }

    pub fn pin_targets(&self) -> Result<Vec<WatchTarget>> {
        self.pins.iter().map(|p| p.parse()).collect()
    }
}
