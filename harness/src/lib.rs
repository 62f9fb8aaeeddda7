//! Session state machine benchmark
//!
//! This crate exports the signaling session state machine, the store it runs
//! against, and the load generator that measures it, for use in integration
//! tests and the `sessionbench` binary.

pub mod config;
pub mod load;
pub mod server;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use load::{BenchmarkRunner, LoadConfig, LoadGenerator, LoadReport, RunReport, Suite};
pub use server::metrics_router;
pub use session::{RoomSessionTracker, SessionError, SessionStateMachine};
pub use store::{MemoryStateStore, StateStore, StoreConfig, StoreError, StoreMode};
