//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

#![allow(dead_code)]

use sessionbench::session::generate_id;
use sessionbench::{MemoryStateStore, SessionStateMachine, StoreConfig, StoreMode};
use std::sync::Arc;
use std::time::Duration;

pub const MODES: [StoreMode; 2] = [StoreMode::Locking, StoreMode::Optimistic];

/// Create a store with the given mode and simulated round-trip latency
pub fn create_store(mode: StoreMode, latency_ms: u64) -> Arc<MemoryStateStore> {
    Arc::new(MemoryStateStore::with_config(StoreConfig {
        mode,
        latency: Duration::from_millis(latency_ms),
    }))
}

/// Create a state machine bound to a fresh store, returning both
pub fn create_machine(mode: StoreMode, latency_ms: u64) -> (SessionStateMachine, Arc<MemoryStateStore>) {
    let store = create_store(mode, latency_ms);
    (SessionStateMachine::new(store.clone()), store)
}

/// Create a room id that does not collide across tests
pub fn create_test_room() -> String {
    format!("room-{}", &generate_id()[..8])
}

/// Create `n` distinct peer ids
pub fn create_test_peers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("peer-{}-{}", i, &generate_id()[..8])).collect()
}
