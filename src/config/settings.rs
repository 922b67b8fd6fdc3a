//! Settings loaded from file and environment.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::data::types::Timeframe;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Gateway endpoint configuration
    pub gateway: GatewaySettings,
    /// Connection manager configuration
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Subscription coordinator configuration
    #[serde(default)]
    pub subscription: SubscriptionSettings,
    /// Bar aggregator configuration
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    /// Historical cache configuration
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Settings {
    /// Load settings from an optional config file plus `MARKETFEED_*`
    /// environment overrides (e.g. `MARKETFEED_GATEWAY__WS_URL`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder.add_source(File::with_name("marketfeed").required(false));
        }

        builder
            .add_source(Environment::with_prefix("MARKETFEED").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Gateway endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// WebSocket endpoint of the streaming gateway
    pub ws_url: String,
    /// Instruments to subscribe to at startup
    #[serde(default)]
    pub default_instruments: Vec<String>,
}

/// Connection manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Reconnection attempts before giving up and entering the error state
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Backoff base; attempt n waits base * 2^n ms (first retry is
    /// immediate)
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Liveness probe interval while connected
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Timeout for a single probe call
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Warn when connected but no inbound activity for this long
    #[serde(default = "default_idle_warning_secs")]
    pub idle_warning_secs: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_idle_warning_secs() -> u64 {
    120
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            idle_warning_secs: default_idle_warning_secs(),
        }
    }
}

impl ConnectionSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn idle_warning(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_warning_secs as i64)
    }
}

/// Subscription coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Timeout per required stream kind attempt
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// Timeout for the optional depth attempt
    #[serde(default = "default_depth_timeout_secs")]
    pub depth_timeout_secs: u64,
}

fn default_stream_timeout_secs() -> u64 {
    10
}

fn default_depth_timeout_secs() -> u64 {
    5
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            stream_timeout_secs: default_stream_timeout_secs(),
            depth_timeout_secs: default_depth_timeout_secs(),
        }
    }
}

impl SubscriptionSettings {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn depth_timeout(&self) -> Duration {
        Duration::from_secs(self.depth_timeout_secs)
    }
}

/// Bar aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSettings {
    /// Bar interval for live aggregation
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    /// Sealed bars retained in memory per instrument for live rendering
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
    /// How often the service sweeps for elapsed buckets on quiet
    /// instruments
    #[serde(default = "default_seal_sweep_ms")]
    pub seal_sweep_ms: u64,
}

fn default_timeframe() -> Timeframe {
    Timeframe::OneMinute
}

fn default_lookback_bars() -> usize {
    256
}

fn default_seal_sweep_ms() -> u64 {
    1_000
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            timeframe: default_timeframe(),
            lookback_bars: default_lookback_bars(),
            seal_sweep_ms: default_seal_sweep_ms(),
        }
    }
}

impl AggregatorSettings {
    pub fn seal_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.seal_sweep_ms)
    }
}

/// Historical cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// PostgreSQL connection URL; in-memory store is used when unset
    #[serde(default)]
    pub database_url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}
