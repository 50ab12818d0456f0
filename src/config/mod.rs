use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

mod log_config;
pub use log_config::LogConfig;

pub static CONFIG: OnceLock<GatewayConfig> = OnceLock::new();

/// Loads configuration from `config.toml` (or the path named by `APP_CONFIG`)
/// merged with `APP_`-prefixed environment variables, and stores it in the
/// process-wide [`CONFIG`] cell.
///
/// Fails fast with a non-zero exit on an invalid or incomplete config, since
/// startup failure is a [`crate::error::ErrorKind::Fatal`] condition.
pub fn init() {
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").global());

    let config = match raw_config.extract::<GatewayConfig>() {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "It looks like your config is invalid. The following error occurred: {e}"
            );
            std::process::exit(1);
        }
    };

    if config.environment.is_production() {
        if !config.server.tls_enabled {
            eprintln!("refusing to start: TLS is disabled in production");
            std::process::exit(1);
        }
        if !config.server.auth_enabled {
            eprintln!("refusing to start: authentication is disabled in production");
            std::process::exit(1);
        }
    }

    crate::config::CONFIG.set(config).expect("config should be set");
}

pub fn get() -> &'static GatewayConfig {
    CONFIG.get().expect("config should be set")
}

/// Environment tag influencing default security posture (§7).
#[derive(
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    #[serde(default)]
    pub environment: Environment,
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub pool: HashMap<String, PoolConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl GatewayConfig {
    /// Returns the pool config for `protocol`, falling back to the
    /// `"default"` entry, or built-in defaults if neither is present.
    pub fn pool_config(&self, protocol: &str) -> PoolConfig {
        self.pool
            .get(protocol)
            .or_else(|| self.pool.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_timeout", with = "duration_secs")]
    pub read_timeout: Duration,
    #[serde(default = "default_write_timeout", with = "duration_secs")]
    pub write_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "duration_secs")]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub auth_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_listen_addr(),
            port: default_port(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            tls_enabled: false,
            auth_enabled: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval", with = "duration_secs")]
    pub refresh_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { enabled: false, refresh_interval: default_refresh_interval() }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct BridgeConfig {
    pub protocols: Vec<String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub default_timeout: Duration,
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,
    #[serde(default = "default_retry_delay", with = "duration_millis")]
    pub default_retry_delay: Duration,
    #[serde(default = "default_health_check_interval", with = "duration_secs")]
    pub health_check_interval: Duration,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_idle_time", with = "duration_secs")]
    pub max_idle_time: Duration,
    #[serde(default = "default_acquire_timeout", with = "duration_millis")]
    pub acquire_timeout: Duration,
    #[serde(default)]
    pub validate_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle_time: default_max_idle_time(),
            acquire_timeout: default_acquire_timeout(),
            validate_on_borrow: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rpm")]
    pub default_limit: u32,
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: default_rpm(),
            shard_count: default_shard_count(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct AdaptiveThresholds {
    #[serde(default = "default_normal_threshold")]
    pub normal_threshold: u64,
    #[serde(default = "default_minimal_threshold")]
    pub minimal_threshold: u64,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            normal_threshold: default_normal_threshold(),
            minimal_threshold: default_minimal_threshold(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_interval", with = "duration_secs")]
    pub interval: Duration,
    #[serde(default)]
    pub adaptive: AdaptiveThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_metrics_interval(),
            adaptive: AdaptiveThresholds::default(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    7800
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_event_buffer_size() -> usize {
    256
}

fn default_max_concurrent_handlers() -> usize {
    64
}

fn default_max_connections() -> usize {
    32
}

fn default_max_idle_time() -> Duration {
    Duration::from_secs(300)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_rpm() -> u32 {
    600
}

fn default_shard_count() -> usize {
    32
}

fn default_normal_threshold() -> u64 {
    1000
}

fn default_minimal_threshold() -> u64 {
    5000
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(10)
}
