//! Configuration management for Sluice.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `SLUICE__*` environment variables (e.g. `SLUICE__SERVER__DOWNSTREAM_URL`).
//! The resulting configuration is immutable once the proxy starts.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "SLUICE";
/// Separator between nested keys in environment variable names.
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Sluice proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Listener and downstream configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Delay applied to rate limited responses
    #[serde(default)]
    pub tarpit: TarpitConfig,
}

/// Listener and downstream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL of the single downstream service
    #[serde(default = "default_downstream_url")]
    pub downstream_url: String,

    /// Upper bound on a whole downstream call, in milliseconds
    #[serde(default = "default_downstream_timeout")]
    pub downstream_timeout_ms: u64,

    /// Upper bound on establishing a downstream connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Largest inbound body buffered before forwarding
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            downstream_url: default_downstream_url(),
            downstream_timeout_ms: default_downstream_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    /// Timeout applied to each downstream call.
    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms)
    }

    /// Timeout applied to downstream connection setup.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_downstream_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_downstream_timeout() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Leaky bucket parameters for one request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimitConfig {
    /// Maximum burst admitted before any draining
    pub burst: u64,

    /// Units drained per drain period
    pub drain_amount: u64,

    /// Length of one drain period, in milliseconds
    #[serde(default = "default_drain_period")]
    pub drain_period_ms: u64,
}

impl ClassLimitConfig {
    /// Length of one drain period.
    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.drain_period_ms)
    }
}

fn default_drain_period() -> u64 {
    1_000
}

fn default_read_limits() -> ClassLimitConfig {
    ClassLimitConfig {
        burst: 50,
        drain_amount: 8,
        drain_period_ms: default_drain_period(),
    }
}

fn default_other_limits() -> ClassLimitConfig {
    ClassLimitConfig {
        burst: 10,
        drain_amount: 1,
        drain_period_ms: default_drain_period(),
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limits applied to `GET` requests
    #[serde(default = "default_read_limits")]
    pub read: ClassLimitConfig,

    /// Limits applied to every other method
    #[serde(default = "default_other_limits")]
    pub other: ClassLimitConfig,

    /// Use `X-Forwarded-For` as the client identity. Only safe behind a
    /// trusted first hop that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Drained buckets unseen for this many seconds are evicted
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// Hard cap on tracked keys; least recently seen beyond it are evicted
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,

    /// How often the eviction sweep runs, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            read: default_read_limits(),
            other: default_other_limits(),
            trust_forwarded_for: false,
            idle_eviction_secs: default_idle_eviction(),
            max_tracked_keys: default_max_tracked_keys(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RateLimitingConfig {
    /// Idle time after which a drained bucket may be evicted.
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    /// Interval between eviction sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_idle_eviction() -> u64 {
    300
}

fn default_max_tracked_keys() -> usize {
    100_000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Tarpit configuration for rate limited responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarpitConfig {
    /// Whether denied requests are delayed at all
    #[serde(default = "default_tarpit_enabled")]
    pub enabled: bool,

    /// Fixed part of the delay, in milliseconds
    #[serde(default = "default_tarpit_base")]
    pub base_ms: u64,

    /// Mean of the normally distributed part, in milliseconds
    #[serde(default = "default_tarpit_range")]
    pub range_ms: u64,

    /// Standard deviation of the normally distributed part, in milliseconds
    #[serde(default = "default_tarpit_stddev")]
    pub stddev_ms: u64,
}

impl Default for TarpitConfig {
    fn default() -> Self {
        Self {
            enabled: default_tarpit_enabled(),
            base_ms: default_tarpit_base(),
            range_ms: default_tarpit_range(),
            stddev_ms: default_tarpit_stddev(),
        }
    }
}

fn default_tarpit_enabled() -> bool {
    true
}

fn default_tarpit_base() -> u64 {
    100
}

fn default_tarpit_range() -> u64 {
    500
}

fn default_tarpit_stddev() -> u64 {
    100
}

impl SluiceConfig {
    /// Load configuration from an optional YAML file plus `SLUICE__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }
        let config: SluiceConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SluiceConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (class, limits) in [("read", &self.rate_limiting.read), ("other", &self.rate_limiting.other)] {
            if limits.burst == 0 {
                return Err(SluiceError::Config(format!("{class}.burst must be non-zero")));
            }
            if limits.drain_amount == 0 {
                return Err(SluiceError::Config(format!("{class}.drain_amount must be non-zero")));
            }
            if limits.drain_period_ms == 0 {
                return Err(SluiceError::Config(format!("{class}.drain_period_ms must be non-zero")));
            }
        }

        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(SluiceError::Config("sweep_interval_secs must be non-zero".into()));
        }

        if self.server.max_body_bytes == 0 {
            return Err(SluiceError::Config("max_body_bytes must be non-zero".into()));
        }

        let url = self.server.downstream_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SluiceError::Config(format!(
                "downstream_url must be an http(s) URL, got {url:?}"
            )));
        }

        Ok(())
    }
}
