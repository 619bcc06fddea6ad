//! Configuration handling for Veil collectors.
//!
//! Two sources, same shape:
//! - environment variables ([`CollectorConfig::from_env`]);
//! - a YAML file ([`CollectorConfig::from_yaml`]).
//!
//! Every value has a default, and every loaded config goes through
//! [`CollectorConfig::validate`].

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::scheduler::SchedulerConfig;

/// High-level configuration for a [`crate::Collector`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Ingestion endpoint receiving noised batches.
    pub endpoint: String,
    /// Lower bound of the randomized flush interval, in seconds.
    pub min_flush_interval_secs: u64,
    /// Upper bound of the randomized flush interval, in seconds.
    pub max_flush_interval_secs: u64,
    /// Buffer size that triggers an immediate flush.
    pub immediate_flush_threshold: usize,
    /// Per-request timeout for the ingestion call, in seconds.
    pub request_timeout_secs: u64,
    /// Directory for durable storage (demo / native hosts).
    pub data_dir: Option<PathBuf>,
    /// Record a `pageview` automatically on every navigation.
    pub auto_page_view: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787/ingest".to_owned(),
            min_flush_interval_secs: 20,
            max_flush_interval_secs: 80,
            immediate_flush_threshold: 20,
            request_timeout_secs: 10,
            data_dir: None,
            auto_page_view: true,
        }
    }
}

impl CollectorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Recognised variables:
    ///
    /// - `VEIL_ENDPOINT` or `VEIL_INGEST_URL`
    /// - `VEIL_MIN_FLUSH_SECS`, `VEIL_MAX_FLUSH_SECS`
    /// - `VEIL_FLUSH_THRESHOLD`
    /// - `VEIL_REQUEST_TIMEOUT_SECS`
    /// - `VEIL_DATA_DIR`
    /// - `VEIL_AUTO_PAGE_VIEW` (`"1"`, `"true"`, `"yes"`, `"on"` → `true`)
    ///
    /// Numeric values that do not parse cause an error.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(raw) = first_env(&["VEIL_ENDPOINT", "VEIL_INGEST_URL"]) {
            cfg.endpoint = raw.trim().to_owned();
        }
        if let Some(raw) = first_env(&["VEIL_MIN_FLUSH_SECS"]) {
            cfg.min_flush_interval_secs = parse_number(&raw, "min flush interval")?;
        }
        if let Some(raw) = first_env(&["VEIL_MAX_FLUSH_SECS"]) {
            cfg.max_flush_interval_secs = parse_number(&raw, "max flush interval")?;
        }
        if let Some(raw) = first_env(&["VEIL_FLUSH_THRESHOLD"]) {
            cfg.immediate_flush_threshold = parse_number(&raw, "flush threshold")?;
        }
        if let Some(raw) = first_env(&["VEIL_REQUEST_TIMEOUT_SECS"]) {
            cfg.request_timeout_secs = parse_number(&raw, "request timeout")?;
        }
        if let Some(raw) = first_env(&["VEIL_DATA_DIR"]) {
            cfg.data_dir = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = first_env(&["VEIL_AUTO_PAGE_VIEW"]) {
            cfg.auto_page_view = parse_bool(&raw);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads configuration from a YAML file. Missing keys take defaults.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            bail!("endpoint must not be empty");
        }
        if self.min_flush_interval_secs == 0 {
            bail!("min flush interval must be > 0");
        }
        if self.min_flush_interval_secs > self.max_flush_interval_secs {
            bail!(
                "min flush interval ({}s) exceeds max flush interval ({}s)",
                self.min_flush_interval_secs,
                self.max_flush_interval_secs
            );
        }
        if self.immediate_flush_threshold == 0 {
            bail!("immediate flush threshold must be > 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("request timeout must be > 0");
        }
        Ok(())
    }

    /// Scheduler settings derived from this config.
    #[must_use]
    pub const fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_interval: Duration::from_secs(self.min_flush_interval_secs),
            max_interval: Duration::from_secs(self.max_flush_interval_secs),
            immediate_flush_threshold: self.immediate_flush_threshold,
        }
    }

    /// Ingestion request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Returns the first defined environment variable from the given list.
fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| env::var(key).ok())
}

fn parse_number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {what}: {raw}"))
}

/// Parses a loose boolean value. Anything unrecognised is `false`.
fn parse_bool(raw: &str) -> bool {
    let v = raw.trim().to_ascii_lowercase();
    matches!(v.as_str(), "1" | "true" | "yes" | "on")
}
