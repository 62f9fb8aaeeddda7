//! In-process state store with switchable concurrency control
//!
//! Rows live in `DashMap` tables and carry a version number. Every primitive
//! is one atomic read-modify-write executed in one of two ways:
//! - `Locking`: take the row's async lock, pay the round trip, mutate
//! - `Optimistic`: read the version, pay the round trip, commit only if the
//!   version is unchanged, otherwise retry
//!
//! The simulated latency is paid once per round trip, which is what makes the
//! two modes behave differently under contention.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::service::StateStore;
use super::types::{StoreConfig, StoreError, StoreMode};
use crate::session::state::{
    PeerId, RoomId, RoomSessionId, SessionRecord, SessionState, SessionTimestamps, UpsertRequest,
    now_millis,
};

/// A row plus its commit counter
#[derive(Debug, Clone)]
struct Versioned<V> {
    version: u64,
    value: V,
}

/// Result of one commit attempt
enum Commit<V> {
    Applied { previous: Option<V>, next: V },
    Unchanged,
    Conflict,
}

/// A committed write
struct Written<V> {
    previous: Option<V>,
    next: V,
}

/// Secondary index per room
#[derive(Debug, Default)]
struct RoomIndex {
    peers: HashSet<PeerId>,
    /// Every room-session ever referenced by a record of the room
    seen_sessions: HashSet<RoomSessionId>,
}

type RecordKey = (RoomId, PeerId);

/// Reference `StateStore` kept entirely in memory
pub struct MemoryStateStore {
    config: StoreConfig,
    records: DashMap<RecordKey, Versioned<SessionRecord>>,
    pointers: DashMap<RoomId, Versioned<Option<RoomSessionId>>>,
    rooms: DashMap<RoomId, RoomIndex>,
    row_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            pointers: DashMap::new(),
            rooms: DashMap::new(),
            row_locks: DashMap::new(),
        }
    }

    pub fn mode(&self) -> StoreMode {
        self.config.mode
    }

    pub fn latency(&self) -> Duration {
        self.config.latency
    }

    /// Number of (room, peer) records
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of records in one room
    pub fn room_record_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|index| index.peers.len()).unwrap_or(0)
    }

    async fn round_trip(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    async fn lock_row(&self, lock_key: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.row_locks
                .entry(lock_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    /// Drop the row lock once no writer holds or awaits it
    fn release_row(&self, lock_key: &str) {
        self.row_locks
            .remove_if(lock_key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Row locks currently allocated
    pub fn row_lock_count(&self) -> usize {
        self.row_locks.len()
    }

    /// Atomically replace the row at `key` with `f(current)`, or leave it alone
    /// when `f` returns `None`.
    async fn write_row<K, V, F>(
        &self,
        table: &DashMap<K, Versioned<V>>,
        key: K,
        lock_key: String,
        f: F,
    ) -> Option<Written<V>>
    where
        K: Eq + Hash + Clone + Send + Sync,
        V: Clone + Send + Sync,
        F: Fn(Option<&V>) -> Option<V> + Sync,
    {
        let guard = match self.config.mode {
            StoreMode::Locking => Some(self.lock_row(&lock_key).await),
            StoreMode::Optimistic => None,
        };

        let written = loop {
            let seen = table.get(&key).map(|row| row.version);
            self.round_trip().await;

            match try_commit(table, &key, seen, &f) {
                Commit::Applied { previous, next } => break Some(Written { previous, next }),
                Commit::Unchanged => break None,
                Commit::Conflict => {
                    counter!("sessionbench_store_conflicts_total").increment(1);
                    trace!("Commit conflict on {}, retrying", lock_key);
                }
            }
        };

        if let Some(guard) = guard {
            drop(guard);
            self.release_row(&lock_key);
        }
        written
    }

    async fn write_record<F>(&self, room_id: &str, peer_id: &str, f: F) -> u64
    where
        F: Fn(Option<&SessionRecord>) -> Option<SessionRecord> + Sync,
    {
        let key = (room_id.to_string(), peer_id.to_string());
        let lock_key = format!("record/{}/{}", room_id, peer_id);
        match self.write_row(&self.records, key, lock_key, f).await {
            Some(written) => {
                self.index_record(&written.next, written.previous.is_none());
                1
            }
            None => 0,
        }
    }

    fn index_record(&self, record: &SessionRecord, inserted: bool) {
        let mut index = self.rooms.entry(record.room_id.clone()).or_default();
        if inserted {
            index.peers.insert(record.peer_id.clone());
        }
        if let Some(session) = &record.room_session_id {
            index.seen_sessions.insert(session.clone());
        }
    }

    fn room_peers(&self, room_id: &str) -> Vec<PeerId> {
        self.rooms
            .get(room_id)
            .map(|index| index.peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn current_pointer(&self, room_id: &str) -> Option<RoomSessionId> {
        self.pointers.get(room_id).and_then(|row| row.value.clone())
    }

    /// Fence check for record writes, evaluated inside the commit
    fn admits(&self, request: &UpsertRequest) -> bool {
        if request.fence.is_none() {
            return true;
        }
        let pointer = self.pointers.get(&request.room_id);
        request.admits_pointer(pointer.as_ref().and_then(|row| row.value.as_deref()))
    }

    fn read_record(&self, room_id: &str, peer_id: &str) -> Option<SessionRecord> {
        self.records
            .get(&(room_id.to_string(), peer_id.to_string()))
            .map(|row| row.value.clone())
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn try_commit<K, V, F>(
    table: &DashMap<K, Versioned<V>>,
    key: &K,
    seen: Option<u64>,
    f: &F,
) -> Commit<V>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(Option<&V>) -> Option<V>,
{
    match table.entry(key.clone()) {
        Entry::Occupied(mut entry) => {
            if seen != Some(entry.get().version) {
                return Commit::Conflict;
            }
            match f(Some(&entry.get().value)) {
                Some(next) => {
                    let row = entry.get_mut();
                    let previous = std::mem::replace(&mut row.value, next.clone());
                    row.version += 1;
                    Commit::Applied {
                        previous: Some(previous),
                        next,
                    }
                }
                None => Commit::Unchanged,
            }
        }
        Entry::Vacant(entry) => {
            if seen.is_some() {
                return Commit::Conflict;
            }
            match f(None) {
                Some(next) => {
                    entry.insert(Versioned {
                        version: 1,
                        value: next.clone(),
                    });
                    Commit::Applied {
                        previous: None,
                        next,
                    }
                }
                None => Commit::Unchanged,
            }
        }
    }
}

fn validate(kind: &'static str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::InvalidKey { kind });
    }
    Ok(())
}

fn validate_request(request: &UpsertRequest) -> Result<(), StoreError> {
    validate("room id", &request.room_id)?;
    validate("peer id", &request.peer_id)?;
    validate("room session id", &request.room_session_id)
}

/// Step-1 write: advance without regressing and fill unset timestamps
fn advanced(record: &SessionRecord, request: &UpsertRequest) -> SessionRecord {
    let mut next = record.clone();
    next.state = record.state.advance_to(request.new_state);
    next.timestamps.fill_from(&request.timestamps);
    next
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_room(&self, room_id: &str) -> Result<(), StoreError> {
        validate("room id", room_id)?;
        let lock_key = format!("room/{}", room_id);
        self.write_row(&self.pointers, room_id.to_string(), lock_key, |current| {
            current.is_none().then_some(None)
        })
        .await;
        self.rooms.entry(room_id.to_string()).or_default();
        Ok(())
    }

    async fn get_latest_room_session(
        &self,
        room_id: &str,
    ) -> Result<Option<RoomSessionId>, StoreError> {
        validate("room id", room_id)?;
        self.round_trip().await;
        Ok(self.current_pointer(room_id))
    }

    async fn set_latest_room_session(
        &self,
        room_id: &str,
        room_session_id: &str,
    ) -> Result<(), StoreError> {
        validate("room id", room_id)?;
        validate("room session id", room_session_id)?;
        let lock_key = format!("room/{}", room_id);
        self.write_row(&self.pointers, room_id.to_string(), lock_key, |current| {
            let unchanged = current.and_then(|pointer| pointer.as_deref()) == Some(room_session_id);
            (!unchanged).then(|| Some(room_session_id.to_string()))
        })
        .await;
        Ok(())
    }

    async fn advance_latest_room_session(
        &self,
        room_id: &str,
        expected: Option<&str>,
        room_session_id: &str,
    ) -> Result<bool, StoreError> {
        validate("room id", room_id)?;
        validate("room session id", room_session_id)?;
        let lock_key = format!("room/{}", room_id);
        let written = self
            .write_row(&self.pointers, room_id.to_string(), lock_key, |current| {
                let pointer = current.and_then(|pointer| pointer.as_deref());
                (pointer != Some(room_session_id) && (pointer.is_none() || pointer == expected))
                    .then(|| Some(room_session_id.to_string()))
            })
            .await;
        if written.is_some() {
            return Ok(true);
        }
        Ok(self.current_pointer(room_id).as_deref() == Some(room_session_id))
    }

    async fn is_brand_new(
        &self,
        room_id: &str,
        room_session_id: &str,
    ) -> Result<bool, StoreError> {
        validate("room id", room_id)?;
        validate("room session id", room_session_id)?;
        self.round_trip().await;
        Ok(self
            .rooms
            .get(room_id)
            .is_none_or(|index| !index.seen_sessions.contains(room_session_id)))
    }

    async fn insert_placeholder(&self, room_id: &str, peer_id: &str) -> Result<u64, StoreError> {
        validate("room id", room_id)?;
        validate("peer id", peer_id)?;
        let now = now_millis();
        Ok(self
            .write_record(room_id, peer_id, |current| {
                current
                    .is_none()
                    .then(|| SessionRecord::placeholder(room_id, peer_id, now))
            })
            .await)
    }

    async fn conditional_update(&self, request: &UpsertRequest) -> Result<u64, StoreError> {
        validate_request(request)?;
        Ok(self
            .write_record(&request.room_id, &request.peer_id, |current| {
                current
                    .filter(|record| {
                        record.is_bound_to(&request.room_session_id) && request.accepts(record)
                    })
                    .filter(|_| self.admits(request))
                    .map(|record| advanced(record, request))
            })
            .await)
    }

    async fn conditional_update_from_created(
        &self,
        request: &UpsertRequest,
    ) -> Result<u64, StoreError> {
        validate_request(request)?;
        Ok(self
            .write_record(&request.room_id, &request.peer_id, |current| {
                current
                    .filter(|record| record.state == SessionState::Created)
                    .filter(|_| self.admits(request))
                    .map(|record| {
                        let mut next = record.clone();
                        next.room_session_id = Some(request.room_session_id.clone());
                        next.state = request.new_state;
                        next.timestamps.fill_from(&request.timestamps);
                        next
                    })
            })
            .await)
    }

    async fn insert_if_absent(&self, request: &UpsertRequest) -> Result<u64, StoreError> {
        validate_request(request)?;
        Ok(self
            .write_record(&request.room_id, &request.peer_id, |current| {
                (current.is_none() && self.admits(request)).then(|| request.to_record())
            })
            .await)
    }

    async fn find_other_live_sessions(
        &self,
        room_id: &str,
        except: &str,
    ) -> Result<HashSet<RoomSessionId>, StoreError> {
        validate("room id", room_id)?;
        self.round_trip().await;
        let sessions = self
            .room_peers(room_id)
            .iter()
            .filter_map(|peer_id| self.read_record(room_id, peer_id))
            .filter(|record| !record.state.is_terminal())
            .filter_map(|record| record.room_session_id)
            .filter(|session| session != except)
            .collect();
        Ok(sessions)
    }

    async fn supersede_and_recreate(
        &self,
        room_id: &str,
        room_session_ids: &HashSet<RoomSessionId>,
        new_room_session_id: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        validate("room id", room_id)?;
        validate("room session id", new_room_session_id)?;
        if room_session_ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_millis();
        let mut superseded = Vec::new();
        for peer_id in self.room_peers(room_id) {
            let key = (room_id.to_string(), peer_id.clone());
            let lock_key = format!("record/{}/{}", room_id, peer_id);
            let written = self
                .write_row(&self.records, key, lock_key, |current| {
                    current
                        .filter(|record| !record.state.is_terminal())
                        .filter(|record| {
                            record
                                .room_session_id
                                .as_ref()
                                .is_some_and(|session| room_session_ids.contains(session))
                        })
                        .map(|record| SessionRecord {
                            room_session_id: None,
                            state: SessionState::Created,
                            timestamps: SessionTimestamps {
                                created_at: Some(now),
                                ..Default::default()
                            },
                            ..record.clone()
                        })
                })
                .await;

            if let Some(Written {
                previous: Some(mut previous),
                next,
            }) = written
            {
                self.index_record(&next, false);
                previous.state = SessionState::Archived;
                superseded.push(previous);
            }
        }

        trace!(
            "Recreated {} records of room {} as placeholders for {}",
            superseded.len(),
            room_id,
            new_room_session_id
        );
        Ok(superseded)
    }

    async fn get_record(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        validate("room id", room_id)?;
        validate("peer id", peer_id)?;
        self.round_trip().await;
        Ok(self.read_record(room_id, peer_id))
    }
}
