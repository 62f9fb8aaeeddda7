//! Benchmark sweep over store configurations

use crate::session::now_millis;
use crate::store::{MemoryStateStore, StoreConfig, StoreMode};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::generator::{LoadConfig, LoadGenerator};
use super::report::LoadReport;

/// One point of the sweep: concurrency-control mode plus simulated latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Suite {
    pub mode: StoreMode,
    pub latency_ms: u64,
}

impl Suite {
    pub fn new(mode: StoreMode, latency_ms: u64) -> Self {
        Self { mode, latency_ms }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            mode: self.mode,
            latency: self.latency(),
        }
    }

    /// Each mode without latency, each mode at 1ms, then locking twice at 30ms
    pub fn default_sweep() -> Vec<Suite> {
        vec![
            Suite::new(StoreMode::Optimistic, 0),
            Suite::new(StoreMode::Locking, 0),
            Suite::new(StoreMode::Optimistic, 1),
            Suite::new(StoreMode::Locking, 1),
            Suite::new(StoreMode::Locking, 30),
            Suite::new(StoreMode::Locking, 30),
        ]
    }

    /// Parse a comma separated list such as `locking@0,optimistic@30`
    pub fn parse_list(list: &str) -> Result<Vec<Suite>, String> {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.mode, self.latency_ms)
    }
}

impl FromStr for Suite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, latency) = s
            .split_once('@')
            .ok_or_else(|| format!("suite '{}' must look like mode@latency_ms", s))?;
        let latency_ms = latency
            .trim()
            .parse()
            .map_err(|_| format!("suite '{}' has an invalid latency", s))?;
        Ok(Suite::new(mode.parse()?, latency_ms))
    }
}

/// Result of one suite
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub suite: Suite,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub load: LoadReport,
}

/// Runs every suite in order with a fresh store, pausing between suites so
/// the external metrics backend sees distinct windows
pub struct BenchmarkRunner {
    load: LoadConfig,
    suites: Vec<Suite>,
    pause_between_samples: Duration,
}

impl BenchmarkRunner {
    pub fn new(load: LoadConfig, suites: Vec<Suite>, pause_between_samples: Duration) -> Self {
        Self {
            load,
            suites,
            pause_between_samples,
        }
    }

    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    pub async fn run_all(&self) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(self.suites.len());
        for (idx, suite) in self.suites.iter().enumerate() {
            if idx > 0 && !self.pause_between_samples.is_zero() {
                tokio::time::sleep(self.pause_between_samples).await;
            }
            reports.push(self.run_suite(*suite).await);
        }
        reports
    }

    pub async fn run_suite(&self, suite: Suite) -> RunReport {
        info!("Running tests. mode: {}, latency: {} ms", suite.mode, suite.latency_ms);
        metrics::gauge!("sessionbench_suite_latency_ms").set(suite.latency_ms as f64);

        let store = Arc::new(MemoryStateStore::with_config(suite.store_config()));
        let generator = LoadGenerator::new(store, self.load);

        let started_at_ms = now_millis();
        let load = generator.run().await;
        let finished_at_ms = now_millis();

        info!(
            "Finished running tests. mode: {}, latency: {} ms. {}",
            suite.mode,
            suite.latency_ms,
            load.report()
        );

        RunReport {
            suite,
            started_at_ms,
            finished_at_ms,
            load,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sweep_shape() {
        let sweep = Suite::default_sweep();
        assert_eq!(sweep.len(), 6);
        assert_eq!(sweep[0], Suite::new(StoreMode::Optimistic, 0));
        assert!(sweep[4..].iter().all(|s| s.mode == StoreMode::Locking && s.latency_ms == 30));
    }

    #[test]
    fn test_suite_parsing() {
        let suites = Suite::parse_list("locking@0, optimistic@30,").unwrap();
        assert_eq!(
            suites,
            vec![
                Suite::new(StoreMode::Locking, 0),
                Suite::new(StoreMode::Optimistic, 30)
            ]
        );
        assert!("locking".parse::<Suite>().is_err());
        assert!("locking@fast".parse::<Suite>().is_err());
        assert!("sharded@1".parse::<Suite>().is_err());
    }

    #[test]
    fn test_suite_display_roundtrips() {
        let suite = Suite::new(StoreMode::Locking, 30);
        assert_eq!(suite.to_string(), "locking@30");
        assert_eq!(suite.to_string().parse::<Suite>(), Ok(suite));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runner_produces_one_report_per_suite() {
        let load = LoadConfig {
            peers_per_room: 3,
            duration: Duration::from_millis(100),
            concurrency: 2,
        };
        let suites = vec![
            Suite::new(StoreMode::Optimistic, 0),
            Suite::new(StoreMode::Locking, 1),
        ];
        let runner = BenchmarkRunner::new(load, suites.clone(), Duration::from_millis(10));

        let reports = runner.run_all().await;
        assert_eq!(reports.len(), 2);
        for (report, suite) in reports.iter().zip(&suites) {
            assert_eq!(report.suite, *suite);
            assert!(report.finished_at_ms >= report.started_at_ms);
            assert!(report.load.cycles_completed > 0);
            assert_eq!(report.load.cycles_abandoned, 0);
        }

        let json = serde_json::to_value(&reports[1]).unwrap();
        assert_eq!(json["suite"]["mode"], "locking");
        assert_eq!(json["suite"]["latency_ms"], 1);
    }
}
