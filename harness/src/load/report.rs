//! Run statistics collected by the load generator

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Samples kept per run; later calls replace kept ones at random
pub const MAX_LATENCY_SAMPLES: usize = 50_000;

/// Latency statistics collected during a run, as a uniform reservoir sample
/// of every recorded call
#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub samples: Vec<Duration>,
    capacity: usize,
    seen: u64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::with_capacity(MAX_LATENCY_SAMPLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity: capacity.max(1),
            seen: 0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(latency);
            return;
        }
        let slot = rand::rng().random_range(0..self.seen);
        if let Some(kept) = self.samples.get_mut(slot as usize) {
            *kept = latency;
        }
    }

    /// Samples currently kept
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Every latency ever recorded, kept or not
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Calculate percentile (0-100)
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort();

        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn p50(&self) -> Option<Duration> {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Option<Duration> {
        self.percentile(99.0)
    }
}

/// Accepted/rejected tally for one kind of call
#[derive(Debug, Default)]
pub struct OutcomeCounter {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl OutcomeCounter {
    pub fn record(&self, accepted: bool) {
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> OutcomeCount {
        OutcomeCount {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCount {
    pub accepted: u64,
    pub rejected: u64,
}

impl OutcomeCount {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }
}

/// Counters shared by every task of one run
#[derive(Debug, Default)]
pub struct LoadCounters {
    pub cycles_completed: AtomicU64,
    pub cycles_abandoned: AtomicU64,
    pub offers: OutcomeCounter,
    pub connects: OutcomeCounter,
    pub disconnects: OutcomeCounter,
    pub latencies: Mutex<LatencyStats>,
}

impl LoadCounters {
    pub fn record_latency(&self, latency: Duration) {
        self.latencies.lock().record(latency);
    }

    pub fn report(&self, duration: Duration) -> LoadReport {
        let (p50, p99) = {
            let stats = self.latencies.lock();
            (stats.p50(), stats.p99())
        };
        let connects = self.connects.snapshot();

        let connected_per_sec = if duration.as_secs_f64() > 0.0 {
            connects.total() as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        LoadReport {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_abandoned: self.cycles_abandoned.load(Ordering::Relaxed),
            offers: self.offers.snapshot(),
            connects,
            disconnects: self.disconnects.snapshot(),
            call_p50_ms: p50.map(|d| d.as_secs_f64() * 1000.0),
            call_p99_ms: p99.map(|d| d.as_secs_f64() * 1000.0),
            duration_ms: duration.as_millis() as u64,
            connected_per_sec,
        }
    }
}

/// Summary of one load generator run
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    pub offers: OutcomeCount,
    pub connects: OutcomeCount,
    pub disconnects: OutcomeCount,
    pub call_p50_ms: Option<f64>,
    pub call_p99_ms: Option<f64>,
    pub duration_ms: u64,
    /// Throughput measure the sweep compares: connected calls per second
    pub connected_per_sec: f64,
}

impl LoadReport {
    pub fn total_calls(&self) -> u64 {
        self.offers.total() + self.connects.total() + self.disconnects.total()
    }

    /// Human readable summary
    pub fn report(&self) -> String {
        format!(
            "cycles: {} completed, {} abandoned | offers: {}/{} accepted | connects: {}/{} accepted | \
             disconnects: {}/{} accepted | p50: {} | p99: {} | {:.1} connected/s over {}ms",
            self.cycles_completed,
            self.cycles_abandoned,
            self.offers.accepted,
            self.offers.total(),
            self.connects.accepted,
            self.connects.total(),
            self.disconnects.accepted,
            self.disconnects.total(),
            format_ms(self.call_p50_ms),
            format_ms(self.call_p99_ms),
            self.connected_per_sec,
            self.duration_ms
        )
    }
}

fn format_ms(value: Option<f64>) -> String {
    value
        .map(|ms| format!("{:.2}ms", ms))
        .unwrap_or_else(|| "n/a".to_string())
}
