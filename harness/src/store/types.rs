//! Store types and errors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a `StateStore` implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid {kind}: identifier must not be empty")]
    InvalidKey { kind: &'static str },
}

/// Which implementation of the atomic primitives the store exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Per-row lock held across the round trip and the mutation
    Locking,
    /// Versioned rows committed by compare-and-swap, retried on conflict
    Optimistic,
}

impl StoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreMode::Locking => "locking",
            StoreMode::Optimistic => "optimistic",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "locking" | "locks" | "true" => Ok(StoreMode::Locking),
            "optimistic" | "nolocks" | "false" => Ok(StoreMode::Optimistic),
            other => Err(format!("unknown store mode '{}'", other)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub mode: StoreMode,
    /// Simulated latency paid once per round trip
    pub latency: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::Optimistic,
            latency: Duration::ZERO,
        }
    }
}
