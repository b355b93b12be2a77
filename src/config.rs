use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::protocol::{CrashReportingLevel, DataCollectionLevel};

/// Top-level configuration for the telemetry transport.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Collector connection configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Monitored application and device identity.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Privacy settings gating which record kinds are captured.
    #[serde(default)]
    pub privacy: PrivacyConfig,

    /// Record cache sizing and eviction configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sending behavior configuration.
    #[serde(default)]
    pub send: SendConfig,
}

/// Collector connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Collector beacon endpoint (e.g., "https://tenant.example.com/mbeacon").
    #[serde(default)]
    pub endpoint: String,

    /// Application id assigned by the collector.
    #[serde(default)]
    pub application_id: String,

    /// Version of the monitored application.
    #[serde(default)]
    pub application_version: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Monitored application and device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Stable device identifier.
    #[serde(default)]
    pub device_id: i64,

    /// Display name of the monitored application.
    #[serde(default)]
    pub application_name: String,

    /// Operating system reported in the beacon preamble.
    #[serde(default)]
    pub operating_system: String,

    /// Device manufacturer reported in the beacon preamble.
    #[serde(default)]
    pub manufacturer: String,

    /// Device model reported in the beacon preamble.
    #[serde(default)]
    pub model_id: String,

    /// Client IP address attached to beacon requests. Optional; an invalid
    /// value is treated as absent.
    #[serde(default)]
    pub client_ip: String,
}

/// Privacy settings gating which record kinds are captured.
#[derive(Debug, Clone, Deserialize)]
pub struct PrivacyConfig {
    /// Data collection level. Default: user_behavior.
    #[serde(default = "default_data_collection_level")]
    pub data_collection_level: DataCollectionLevel,

    /// Crash reporting level. Default: opt_in.
    #[serde(default = "default_crash_reporting_level")]
    pub crash_reporting_level: CrashReportingLevel,
}

/// Record cache sizing and eviction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum age a record may reach before eviction. Default: 105m.
    #[serde(default = "default_max_record_age", with = "humantime_serde")]
    pub max_record_age: Duration,

    /// Target size after a memory eviction pass. Default: 80MB.
    #[serde(default = "default_lower_memory_bound")]
    pub lower_memory_bound: usize,

    /// Size that triggers a memory eviction pass. Default: 100MB.
    #[serde(default = "default_upper_memory_bound")]
    pub upper_memory_bound: usize,

    /// Interval between eviction passes. Default: 1s.
    #[serde(default = "default_eviction_interval", with = "humantime_serde")]
    pub eviction_interval: Duration,
}

/// Sending behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SendConfig {
    /// Server id used before the first status response assigns one. Default: 1.
    #[serde(default = "default_server_id")]
    pub default_server_id: i32,

    /// Bytes reserved below the server beacon size limit for the next
    /// chunk's possible overshoot. Default: 1024.
    #[serde(default = "default_beacon_size_safety_margin")]
    pub beacon_size_safety_margin: usize,
}

// --- Default value functions ---

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_data_collection_level() -> DataCollectionLevel {
    DataCollectionLevel::UserBehavior
}

fn default_crash_reporting_level() -> CrashReportingLevel {
    CrashReportingLevel::OptIn
}

fn default_max_record_age() -> Duration {
    Duration::from_secs(105 * 60)
}

fn default_lower_memory_bound() -> usize {
    80 * 1024 * 1024
}

fn default_upper_memory_bound() -> usize {
    100 * 1024 * 1024
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_server_id() -> i32 {
    1
}

fn default_beacon_size_safety_margin() -> usize {
    1024
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            device: DeviceConfig::default(),
            privacy: PrivacyConfig::default(),
            cache: CacheConfig::default(),
            send: SendConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            application_id: String::new(),
            application_version: String::new(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            application_name: String::new(),
            operating_system: String::new(),
            manufacturer: String::new(),
            model_id: String::new(),
            client_ip: String::new(),
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            data_collection_level: default_data_collection_level(),
            crash_reporting_level: default_crash_reporting_level(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_record_age: default_max_record_age(),
            lower_memory_bound: default_lower_memory_bound(),
            upper_memory_bound: default_upper_memory_bound(),
            eviction_interval: default_eviction_interval(),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            default_server_id: default_server_id(),
            beacon_size_safety_margin: default_beacon_size_safety_margin(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.http.endpoint.is_empty() {
            bail!("http.endpoint is required");
        }

        if self.http.application_id.is_empty() {
            bail!("http.application_id is required");
        }

        if self.http.timeout.is_zero() {
            bail!("http.timeout must be positive");
        }

        if self.cache.eviction_interval.is_zero() {
            bail!("cache.eviction_interval must be positive");
        }

        if self.cache.max_record_age.is_zero() {
            bail!("cache.max_record_age must be positive");
        }

        if self.cache.lower_memory_bound >= self.cache.upper_memory_bound {
            bail!("cache.lower_memory_bound must be below cache.upper_memory_bound");
        }

        if self.send.beacon_size_safety_margin == 0 {
            bail!("send.beacon_size_safety_margin must be positive");
        }

        Ok(())
    }
}
