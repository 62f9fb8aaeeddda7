//! Load generation
//!
//! This module provides:
//! - `LoadGenerator`, concurrent cycle workers that play rooms through join
//!   storms, session handovers and idle disconnect storms
//! - `BenchmarkRunner`, a sweep of store configurations (`Suite`s)
//! - `LoadReport` / `RunReport` summaries of each run

mod generator;
mod report;
mod runner;

pub use generator::{CycleError, LoadConfig, LoadGenerator};
pub use report::{LatencyStats, LoadReport, OutcomeCount};
pub use runner::{BenchmarkRunner, RunReport, Suite};
