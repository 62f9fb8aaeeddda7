//! Session storage
//!
//! This module provides:
//! - `StateStore` trait with the atomic primitives the state machine relies on
//! - `MemoryStateStore`, an in-process implementation with a row-locking and
//!   an optimistic mode plus simulated round-trip latency

mod memory;
mod service;
mod types;

pub use memory::MemoryStateStore;
pub use service::StateStore;
pub use types::{StoreConfig, StoreError, StoreMode};
