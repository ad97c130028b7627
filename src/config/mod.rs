//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if the storage root is missing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::wait::{ExponentialBackoff, FixedInterval, WaitStrategy};
use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Longest accepted visibility timeout (100 years). Reservation deadlines
/// are stored as unix milliseconds and must stay representable.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Queue settings
// ---------------------------------------------------------------------------

/// Behaviour knobs shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// How long `reserve`/`take` wait when the caller passes no timeout.
    pub default_timeout: Duration,
    /// How long a reservation lasts before the message becomes visible
    /// again. `None` means reservations never lapse.
    pub visibility_timeout: Option<Duration>,
    /// First delay between polls of an empty queue.
    pub poll_interval: Duration,
    /// Upper bound the poll delay backs off to.
    pub max_poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            visibility_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be greater than zero".into()));
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(Error::Config(format!(
                "max poll interval ({:?}) is shorter than poll interval ({:?})",
                self.max_poll_interval, self.poll_interval
            )));
        }
        if let Some(vt) = self.visibility_timeout {
            if vt.is_zero() {
                return Err(Error::Config("visibility timeout must be greater than zero".into()));
            }
            if vt > MAX_VISIBILITY_TIMEOUT {
                return Err(Error::Config(format!(
                    "visibility timeout ({vt:?}) exceeds the maximum of {MAX_VISIBILITY_TIMEOUT:?}"
                )));
            }
        }
        Ok(())
    }

    /// Fixed polling when both intervals agree, exponential backoff otherwise.
    pub fn wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        if self.poll_interval == self.max_poll_interval {
            Arc::new(FixedInterval(self.poll_interval))
        } else {
            Arc::new(ExponentialBackoff::new(self.poll_interval, self.max_poll_interval))
        }
    }
}

// ---------------------------------------------------------------------------
// Queue config
// ---------------------------------------------------------------------------

/// Everything needed to open one durable queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub storage_root: PathBuf,
    pub settings: QueueSettings,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, storage_root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(name).storage_root(storage_root).build()
    }

    pub fn builder(name: impl Into<String>) -> QueueConfigBuilder {
        QueueConfigBuilder {
            name: name.into(),
            storage_root: None,
            settings: QueueSettings::default(),
        }
    }
}

/// Builder for [`QueueConfig`]. `build` fails if no storage root was given.
#[derive(Debug, Clone)]
pub struct QueueConfigBuilder {
    name: String,
    storage_root: Option<PathBuf>,
    settings: QueueSettings,
}

impl QueueConfigBuilder {
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.settings.default_timeout = timeout;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.settings.visibility_timeout = Some(timeout);
        self
    }

    /// Also raises the backoff cap if it would otherwise be below `interval`.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self.settings.max_poll_interval = self.settings.max_poll_interval.max(interval);
        self
    }

    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.max_poll_interval = interval;
        self
    }

    pub fn build(self) -> Result<QueueConfig> {
        validate_name(&self.name)?;
        let storage_root = self
            .storage_root
            .filter(|root| !root.as_os_str().is_empty())
            .ok_or_else(|| Error::Config(format!("no storage root configured for queue {:?}", self.name)))?;
        self.settings.validate()?;
        Ok(QueueConfig {
            name: self.name,
            storage_root,
            settings: self.settings,
        })
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config("queue name must not be empty".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Process config
// ---------------------------------------------------------------------------

/// Process-wide configuration: where queues live, how they behave, and
/// where telemetry goes.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_root: PathBuf,
    pub settings: QueueSettings,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// On-disk / environment shape before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    storage_root: Option<PathBuf>,
    default_timeout_secs: Option<u64>,
    visibility_timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    max_poll_interval_ms: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Reads `WORKQ_STORAGE_ROOT` (required), `WORKQ_DEFAULT_TIMEOUT_SECS`,
    /// `WORKQ_VISIBILITY_TIMEOUT_SECS`, `WORKQ_POLL_INTERVAL_MS`,
    /// `WORKQ_MAX_POLL_INTERVAL_MS`, `OTEL_ENDPOINT` and `LOG_LEVEL`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("{key}={raw:?} is not a number: {e}")))
                })
                .transpose()
        };

        RawConfig {
            storage_root: lookup("WORKQ_STORAGE_ROOT").map(PathBuf::from),
            default_timeout_secs: number("WORKQ_DEFAULT_TIMEOUT_SECS")?,
            visibility_timeout_secs: number("WORKQ_VISIBILITY_TIMEOUT_SECS")?,
            poll_interval_ms: number("WORKQ_POLL_INTERVAL_MS")?,
            max_poll_interval_ms: number("WORKQ_MAX_POLL_INTERVAL_MS")?,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL"),
        }
        .into_config()
    }

    /// Parse a TOML document with the same keys, lowercased and without the
    /// `WORKQ_` prefix (`storage_root`, `default_timeout_secs`, ...).
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(source).map_err(|e| Error::Config(format!("invalid config file: {e}")))?;
        raw.into_config()
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Config for one named queue under this process's storage root.
    pub fn queue(&self, name: impl Into<String>) -> Result<QueueConfig> {
        QueueConfig::builder(name)
            .storage_root(&self.storage_root)
            .settings(self.settings.clone())
            .build()
    }
}

impl RawConfig {
    fn into_config(self) -> Result<Config> {
        let storage_root = self
            .storage_root
            .filter(|root| !root.as_os_str().is_empty())
            .ok_or_else(|| Error::Config("required setting WORKQ_STORAGE_ROOT / storage_root is not set".into()))?;

        let defaults = QueueSettings::default();
        let poll_interval = self
            .poll_interval_ms
            .map_or(defaults.poll_interval, Duration::from_millis);
        let settings = QueueSettings {
            default_timeout: self
                .default_timeout_secs
                .map_or(defaults.default_timeout, Duration::from_secs),
            visibility_timeout: self.visibility_timeout_secs.map(Duration::from_secs),
            poll_interval,
            max_poll_interval: self
                .max_poll_interval_ms
                .map_or(defaults.max_poll_interval.max(poll_interval), Duration::from_millis),
        };
        settings.validate()?;

        Ok(Config {
            storage_root,
            settings,
            otel_endpoint: self.otel_endpoint,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}
