//! Configuration loading and management.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

/// Configuration shared with a running driver.
///
/// The driver re-reads the server list from here on every connection
/// attempt, so a rehash between attempts takes effect without a restart.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Bot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network to connect to.
    pub network: NetworkConfig,
    /// Connection driver tuning.
    #[serde(default)]
    pub driver: DriverConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Wrap the configuration for sharing with a driver.
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

/// Network identity and server list.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Network name (e.g. "libera").
    pub name: String,
    /// Candidate servers, tried in order with wraparound.
    #[serde(default)]
    pub servers: Vec<Endpoint>,
    /// Local address to bind outgoing sockets to (vhost).
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
}

/// One candidate server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// Port to connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whether this endpoint expects a TLS handshake.
    #[serde(default)]
    pub tls: bool,
}

fn default_port() -> u16 {
    6667
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Driver tuning knobs. All durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Steady-state poll interval.
    pub poll_interval: f64,
    /// First reconnect delay; the backoff doubles from here.
    pub base_reconnect_wait: f64,
    /// Ceiling on the reconnect delay.
    pub max_reconnect_wait: f64,
    /// Lower bound on the connect timeout. The effective timeout is the
    /// larger of this and ten poll intervals.
    pub min_connect_timeout: f64,
    /// How long to wait before probing a connect that is still in progress.
    pub connect_probe_delay: f64,
    /// Consecutive would-block errors tolerated before the connection is
    /// declared dead.
    pub transient_error_limit: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: 1.0,
            base_reconnect_wait: 10.0,
            max_reconnect_wait: 300.0,
            min_connect_timeout: 10.0,
            connect_probe_delay: 60.0,
            transient_error_limit: 120,
        }
    }
}

impl DriverConfig {
    /// Steady-state poll interval.
    pub fn poll(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    /// Base reconnect delay.
    pub fn base_wait(&self) -> Duration {
        Duration::from_secs_f64(self.base_reconnect_wait)
    }

    /// Maximum reconnect delay.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_reconnect_wait)
    }

    /// Delay before the connectedness check of an in-progress connect.
    pub fn probe_delay(&self) -> Duration {
        Duration::from_secs_f64(self.connect_probe_delay)
    }

    /// Connect timeout: generous, since connection setup can take longer
    /// than steady-state I/O.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.min_connect_timeout).max(self.poll() * 10)
    }
}
