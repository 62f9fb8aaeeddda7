//! Benchmark configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default |
//! |---|---|
//! | `NUM_PEERS` | 10 |
//! | `TEST_DURATION_MILLIS` | 30000 |
//! | `TEST_CONCURRENCY` | 8 |
//! | `PAUSE_BETWEEN_SAMPLES_MILLIS` | 5000 |
//! | `BENCH_SUITES` | the default sweep |
//! | `METRICS_ENABLED` | true |
//! | `METRICS_HOST` | 0.0.0.0 |
//! | `METRICS_PORT` | 9464 |

use crate::load::{LoadConfig, Suite};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid BENCH_SUITES: {0}")]
    InvalidSuite(String),
}

/// Main benchmark configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Load generator settings, shared by every suite
    pub load: LoadConfig,
    /// Idle time between two suites
    pub pause_between_samples: Duration,
    /// Store configurations to sweep, in order
    pub suites: Vec<Suite>,
    /// Prometheus exposition
    pub metrics: MetricsConfig,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            load: LoadConfig::default(),
            pause_between_samples: Duration::from_secs(5),
            suites: Suite::default_sweep(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9464,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Unparseable numbers
    /// keep their defaults; an unparseable suite list is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Load
        if let Some(val) = lookup("NUM_PEERS")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            config.load.peers_per_room = n;
        }
        if let Some(val) = lookup("TEST_DURATION_MILLIS")
            && let Ok(ms) = val.parse()
        {
            config.load.duration = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("TEST_CONCURRENCY")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            config.load.concurrency = n;
        }
        if let Some(val) = lookup("PAUSE_BETWEEN_SAMPLES_MILLIS")
            && let Ok(ms) = val.parse()
        {
            config.pause_between_samples = Duration::from_millis(ms);
        }

        // Suites
        if let Some(val) = lookup("BENCH_SUITES")
            && !val.trim().is_empty()
        {
            let suites = Suite::parse_list(&val).map_err(ConfigError::InvalidSuite)?;
            if suites.is_empty() {
                return Err(ConfigError::InvalidSuite("no suites listed".to_string()));
            }
            config.suites = suites;
        }

        // Metrics
        if let Some(val) = lookup("METRICS_ENABLED") {
            config.metrics.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Some(host) = lookup("METRICS_HOST")
            && !host.is_empty()
        {
            config.metrics.host = host;
        }
        if let Some(val) = lookup("METRICS_PORT")
            && let Ok(port) = val.parse()
        {
            config.metrics.port = port;
        }

        Ok(config)
    }
}
