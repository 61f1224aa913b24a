//! Configuration.
//!
//! Loaded from an optional TOML file; every section falls back to defaults
//! so an empty file (or no file) is a valid configuration. Command-line
//! flags are applied on top by the binary.
//!
//! ```toml
//! [log]
//! level = "info"
//! format = "json"
//!
//! [index]
//! path = "/var/lib/hijacks/events.db"
//! query_size = 1000
//! scroll_timeout = "10m"
//!
//! [source]
//! root = "/data/swift"
//!
//! [backfill]
//! window_secs = 86400
//! lookback_slack_secs = 3600
//!
//! [retag]
//! processes = 4
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::sqlite_index::DEFAULT_MAX_DOCUMENT_BYTES;
use crate::tracker::DEFAULT_LOOKBACK_SLACK_SECS;

/// Default seconds of cache files read before the requested start.
pub const DEFAULT_WINDOW_SECS: u64 = 86_400;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid(format!(
                "unknown log format {other:?} (expected pretty or json)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// SQLite database file.
    pub path: PathBuf,
    pub max_document_bytes: usize,
    /// Documents per page when scanning the index.
    pub query_size: usize,
    /// How long a scroll cursor stays valid between pages, e.g. `"10m"`.
    pub scroll_timeout: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hijack-events.db"),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            query_size: crate::index::DEFAULT_QUERY_SIZE,
            scroll_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory holding one `bgp-hijacks-{type}` container per event type.
    pub root: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub window_secs: u64,
    pub lookback_slack_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            lookback_slack_secs: DEFAULT_LOOKBACK_SLACK_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetagConfigSection {
    /// Worker count; 0 means one per available core.
    pub processes: usize,
}

impl Default for RetagConfigSection {
    fn default() -> Self {
        Self { processes: 1 }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub index: IndexConfig,
    pub source: SourceConfig,
    pub backfill: BackfillConfig,
    pub retag: RetagConfigSection,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.query_size == 0 {
            return Err(ConfigError::Invalid("index.query_size must be > 0".to_string()));
        }
        if self.index.max_document_bytes == 0 {
            return Err(ConfigError::Invalid(
                "index.max_document_bytes must be > 0".to_string(),
            ));
        }
        if parse_duration(&self.index.scroll_timeout)?.is_zero() {
            return Err(ConfigError::Invalid(
                "index.scroll_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Scroll timeout as a `Duration`.
    pub fn scroll_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.index.scroll_timeout)
    }
}

/// Resolve a worker count where 0 means "all cores".
#[must_use]
pub fn resolve_processes(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Parse durations such as `"90s"`, `"10m"`, `"1h30m"`. A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let raw = s.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    if raw.is_empty() {
        return Err(invalid());
    }

    let mut total_secs: u64 = 0;
    let mut digits = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        total_secs = value
            .checked_mul(unit)
            .and_then(|v| total_secs.checked_add(v))
            .ok_or_else(invalid)?;
    }
    if !digits.is_empty() {
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total_secs = total_secs.checked_add(value).ok_or_else(invalid)?;
    }
    Ok(Duration::from_secs(total_secs))
}
