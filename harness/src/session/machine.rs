use crate::session::state::{
    CONNECTED_PREDECESSORS, DISCONNECTED_PREDECESSORS, FIRST_OFFER_PREDECESSORS, SessionState,
    UpsertRequest,
};
use crate::session::tracker::{Liveness, RoomSessionTracker};
use crate::store::{StateStore, StoreError};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, trace};

/// State machine errors. Stale or superseded messages are not errors: they
/// come back as `Ok(false)`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Every write attempt affected zero rows on a non-terminal record
    #[error("Failed to update room session record, 0 rows updated. request: {request:?}")]
    ConsistencyViolation { request: Box<UpsertRequest> },
}

/// Signaling events, used as metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Offer,
    Connected,
    Disconnected,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Offer => "offer",
            Operation::Connected => "connected",
            Operation::Disconnected => "disconnected",
        }
    }
}

/// One rung of the cascading write. Each rung matches more loosely than the
/// one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAttempt {
    /// Record bound to the same room-session, in an accepted predecessor state
    MatchSession,
    /// Record still CREATED under any session id (fresh placeholder)
    ClaimCreated,
    /// No record at all
    InsertIfAbsent,
    /// Someone else's insert committed between our attempts
    RetryMatchSession,
}

pub const WRITE_LADDER: [WriteAttempt; 4] = [
    WriteAttempt::MatchSession,
    WriteAttempt::ClaimCreated,
    WriteAttempt::InsertIfAbsent,
    WriteAttempt::RetryMatchSession,
];

impl WriteAttempt {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteAttempt::MatchSession => "match_session",
            WriteAttempt::ClaimCreated => "claim_created",
            WriteAttempt::InsertIfAbsent => "insert_if_absent",
            WriteAttempt::RetryMatchSession => "retry_match_session",
        }
    }

    async fn execute(
        self,
        store: &dyn StateStore,
        request: &UpsertRequest,
    ) -> Result<u64, StoreError> {
        match self {
            WriteAttempt::MatchSession | WriteAttempt::RetryMatchSession => {
                store.conditional_update(request).await
            }
            WriteAttempt::ClaimCreated => store.conditional_update_from_created(request).await,
            WriteAttempt::InsertIfAbsent => store.insert_if_absent(request).await,
        }
    }
}

/// Session state machine: validates transitions and persists them with the
/// staleness check plus cascading write, without holding locks across calls.
///
/// The machine keeps no in-process state, so any number of instances (in any
/// number of processes) may share one store.
#[derive(Clone)]
pub struct SessionStateMachine {
    store: Arc<dyn StateStore>,
    tracker: RoomSessionTracker,
}

impl SessionStateMachine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let tracker = RoomSessionTracker::new(Arc::clone(&store));
        Self { store, tracker }
    }

    pub fn tracker(&self) -> &RoomSessionTracker {
        &self.tracker
    }

    /// Ensure a record exists for (room, peer). Never clobbers an existing one.
    pub async fn create_session(&self, room_id: &str, peer_id: &str) -> Result<(), SessionError> {
        let inserted = self.store.insert_placeholder(room_id, peer_id).await?;
        trace!(
            "Ensured session for room_id={}, peer_id={}. inserted: {}",
            room_id,
            peer_id,
            inserted > 0
        );
        Ok(())
    }

    /// Handle an offer. A brand-new room-session supersedes every other live
    /// session in the room before this peer's record is advanced.
    pub async fn offer_received(
        &self,
        room_id: &str,
        peer_id: &str,
        room_session_id: &str,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();

        let mut accepted = self.tracker.is_live(room_id, room_session_id).await?;
        if accepted {
            self.supersede_other_sessions(room_id, room_session_id)
                .await?;
            accepted = self
                .upsert(UpsertRequest::new(
                    room_id,
                    peer_id,
                    room_session_id,
                    SessionState::FirstOfferReceived,
                    FIRST_OFFER_PREDECESSORS,
                ))
                .await?;
        }

        trace!(
            "Acknowledged offer from room_id={}, peer_id={}, room_session_id={}. accepted: {}",
            room_id, peer_id, room_session_id, accepted
        );

        record_call(Operation::Offer, accepted, start);
        Ok(accepted)
    }

    pub async fn connected(
        &self,
        room_id: &str,
        peer_id: &str,
        room_session_id: &str,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();

        let accepted = self
            .upsert(UpsertRequest::new(
                room_id,
                peer_id,
                room_session_id,
                SessionState::Connected,
                CONNECTED_PREDECESSORS,
            ))
            .await?;

        record_call(Operation::Connected, accepted, start);
        counter!("sessionbench_calls_connected_total").increment(1);
        Ok(accepted)
    }

    pub async fn disconnected(
        &self,
        room_id: &str,
        peer_id: &str,
        room_session_id: &str,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();

        let accepted = self
            .upsert(UpsertRequest::new(
                room_id,
                peer_id,
                room_session_id,
                SessionState::Disconnected,
                DISCONNECTED_PREDECESSORS,
            ))
            .await?;

        record_call(Operation::Disconnected, accepted, start);
        Ok(accepted)
    }

    async fn supersede_other_sessions(
        &self,
        room_id: &str,
        room_session_to_keep: &str,
    ) -> Result<(), SessionError> {
        let stalled = self
            .store
            .find_other_live_sessions(room_id, room_session_to_keep)
            .await?;
        if stalled.is_empty() {
            return Ok(());
        }

        let superseded = self
            .store
            .supersede_and_recreate(room_id, &stalled, room_session_to_keep)
            .await?;
        counter!("sessionbench_sessions_superseded_total").increment(superseded.len() as u64);
        debug!(
            "Room {} moved to session {}: superseded {} records of sessions {:?}",
            room_id,
            room_session_to_keep,
            superseded.len(),
            stalled
        );
        Ok(())
    }

    /// Staleness check, then the write ladder fenced on the pointer the check
    /// saw, then a compare-and-set of the pointer. The pointer goes last so no
    /// caller holds the room row while the record write is in flight.
    async fn upsert(&self, request: UpsertRequest) -> Result<bool, SessionError> {
        let observed = match self
            .tracker
            .check(&request.room_id, &request.room_session_id)
            .await?
        {
            Liveness::Live { pointer } => pointer,
            Liveness::Stale => return Ok(false),
        };
        let request = request.fenced(observed.clone());

        let mut winner = None;
        for attempt in WRITE_LADDER {
            if attempt.execute(self.store.as_ref(), &request).await? > 0 {
                winner = Some(attempt);
                break;
            }
        }

        let Some(attempt) = winner else {
            return self.resolve_exhausted(request).await;
        };
        counter!("sessionbench_write_attempts_total", "step" => attempt.as_str()).increment(1);

        let current = self
            .store
            .advance_latest_room_session(
                &request.room_id,
                observed.as_deref(),
                &request.room_session_id,
            )
            .await?;
        if !current {
            counter!("sessionbench_pointer_races_total").increment(1);
            trace!(
                "Room {} moved past {} while writing peer {}, rejecting {}",
                request.room_id, request.room_session_id, request.peer_id, request.new_state
            );
        }
        Ok(current)
    }

    /// All four attempts missed. A pointer that moved to another session or a
    /// record parked in a terminal state is a normal conflict; anything else
    /// means a store primitive broke.
    async fn resolve_exhausted(&self, request: UpsertRequest) -> Result<bool, SessionError> {
        let pointer = self.store.get_latest_room_session(&request.room_id).await?;
        if !request.admits_pointer(pointer.as_deref()) {
            trace!(
                "Room {} moved to {:?} during the write, rejecting {} for {}",
                request.room_id, pointer, request.new_state, request.room_session_id
            );
            return Ok(false);
        }

        let record = self
            .store
            .get_record(&request.room_id, &request.peer_id)
            .await?;

        match record {
            Some(record) if record.state.is_terminal() => {
                trace!(
                    "Record for room_id={}, peer_id={} already {} on {:?}, rejecting {}",
                    request.room_id,
                    request.peer_id,
                    record.state,
                    record.room_session_id,
                    request.new_state
                );
                Ok(false)
            }
            _ => {
                error!(
                    "Cascading write exhausted for room_id={}, peer_id={}, room_session_id={}",
                    request.room_id, request.peer_id, request.room_session_id
                );
                Err(SessionError::ConsistencyViolation {
                    request: Box::new(request),
                })
            }
        }
    }
}

fn record_call(operation: Operation, accepted: bool, start: Instant) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!(
        "sessionbench_upsert_requests_total",
        "op" => operation.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("sessionbench_upsert_request_duration_seconds", "op" => operation.as_str())
        .record(start.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::{RoomSessionId, SessionRecord, generate_id};
    use crate::store::{MemoryStateStore, StoreConfig, StoreMode};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    fn machine() -> (Arc<MemoryStateStore>, SessionStateMachine) {
        let store = Arc::new(MemoryStateStore::new());
        let machine = SessionStateMachine::new(store.clone());
        (store, machine)
    }

    async fn state_of(store: &MemoryStateStore, room: &str, peer: &str) -> SessionRecord {
        store
            .get_record(room, peer)
            .await
            .unwrap()
            .expect("record should exist")
    }

    #[tokio::test]
    async fn test_full_lifecycle_for_one_peer() {
        let (store, machine) = machine();

        machine.create_session("r", "p").await.unwrap();
        let record = state_of(&store, "r", "p").await;
        assert_eq!(record.state, SessionState::Created);
        assert!(record.is_placeholder());

        assert!(machine.offer_received("r", "p", "s1").await.unwrap());
        assert_eq!(
            state_of(&store, "r", "p").await.state,
            SessionState::FirstOfferReceived
        );

        assert!(machine.connected("r", "p", "s1").await.unwrap());
        assert_eq!(state_of(&store, "r", "p").await.state, SessionState::Connected);

        assert!(machine.offer_received("r", "p", "s1").await.unwrap());
        assert_eq!(state_of(&store, "r", "p").await.state, SessionState::Connected);

        assert!(machine.disconnected("r", "p", "s1").await.unwrap());
        let record = state_of(&store, "r", "p").await;
        assert_eq!(record.state, SessionState::Disconnected);
        assert!(record.is_bound_to("s1"));
    }

    #[tokio::test]
    async fn test_second_create_session_is_noop() {
        let (store, machine) = machine();
        machine.create_session("r", "p").await.unwrap();
        assert!(machine.offer_received("r", "p", "s1").await.unwrap());

        machine.create_session("r", "p").await.unwrap();
        let record = state_of(&store, "r", "p").await;
        assert_eq!(record.state, SessionState::FirstOfferReceived);
        assert!(record.is_bound_to("s1"));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_pointer_follows_accepted_writes() {
        let (store, machine) = machine();
        machine.create_session("r", "p").await.unwrap();
        machine.offer_received("r", "p", "s1").await.unwrap();
        assert_eq!(
            store.get_latest_room_session("r").await.unwrap().as_deref(),
            Some("s1")
        );
    }

    #[tokio::test]
    async fn test_superseded_session_offer_is_rejected() {
        let (store, machine) = machine();
        machine.create_session("r", "p").await.unwrap();
        assert!(machine.offer_received("r", "p", "s0").await.unwrap());
        assert!(machine.offer_received("r", "p", "s1").await.unwrap());
        assert!(machine.connected("r", "p", "s1").await.unwrap());

        assert!(!machine.offer_received("r", "p", "s0").await.unwrap());
        let record = state_of(&store, "r", "p").await;
        assert_eq!(record.state, SessionState::Connected);
        assert!(record.is_bound_to("s1"));
    }

    #[tokio::test]
    async fn test_handover_rejects_every_write_for_old_session() {
        let (store, machine) = machine();
        for peer in ["a", "b"] {
            machine.create_session("r", peer).await.unwrap();
            assert!(machine.offer_received("r", peer, "A").await.unwrap());
            assert!(machine.connected("r", peer, "A").await.unwrap());
        }

        assert!(machine.offer_received("r", "a", "B").await.unwrap());
        let before = state_of(&store, "r", "b").await;
        assert_eq!(before.state, SessionState::Created);
        assert!(before.is_placeholder());

        assert!(!machine.offer_received("r", "b", "A").await.unwrap());
        assert!(!machine.connected("r", "b", "A").await.unwrap());
        assert!(!machine.disconnected("r", "b", "A").await.unwrap());
        assert_eq!(state_of(&store, "r", "b").await, before);

        // b can still join the live session from its placeholder
        assert!(machine.offer_received("r", "b", "B").await.unwrap());
        assert!(machine.connected("r", "b", "B").await.unwrap());
        assert_eq!(state_of(&store, "r", "b").await.state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_offer_without_create_inserts_record() {
        let (store, machine) = machine();
        assert!(machine.offer_received("r", "p", "s1").await.unwrap());
        let record = state_of(&store, "r", "p").await;
        assert_eq!(record.state, SessionState::FirstOfferReceived);
        assert!(record.timestamps.created_at.is_some());
        assert!(record.timestamps.first_offer_at.is_some());
    }

    #[tokio::test]
    async fn test_connected_is_idempotent() {
        let (store, machine) = machine();
        machine.offer_received("r", "p", "s1").await.unwrap();
        assert!(machine.connected("r", "p", "s1").await.unwrap());
        let first = state_of(&store, "r", "p").await;
        assert!(machine.connected("r", "p", "s1").await.unwrap());
        assert_eq!(state_of(&store, "r", "p").await, first);
    }

    #[tokio::test]
    async fn test_offer_after_disconnect_is_rejected() {
        let (store, machine) = machine();
        machine.offer_received("r", "p", "s1").await.unwrap();
        machine.disconnected("r", "p", "s1").await.unwrap();

        assert!(!machine.offer_received("r", "p", "s1").await.unwrap());
        assert!(!machine.connected("r", "p", "s1").await.unwrap());
        assert_eq!(
            state_of(&store, "r", "p").await.state,
            SessionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_timestamps_are_filled_and_non_decreasing() {
        let (store, machine) = machine();
        machine.create_session("r", "p").await.unwrap();
        machine.offer_received("r", "p", "s1").await.unwrap();
        machine.connected("r", "p", "s1").await.unwrap();
        machine.disconnected("r", "p", "s1").await.unwrap();

        let ts = state_of(&store, "r", "p").await.timestamps;
        let created = ts.created_at.unwrap();
        let offered = ts.first_offer_at.unwrap();
        let connected = ts.connected_at.unwrap();
        let disconnected = ts.disconnected_at.unwrap();
        assert!(created <= offered);
        assert!(offered <= connected);
        assert!(connected <= disconnected);
    }

    #[tokio::test]
    async fn test_ladder_order_is_increasingly_permissive() {
        assert_eq!(WRITE_LADDER[0], WriteAttempt::MatchSession);
        assert_eq!(WRITE_LADDER[1], WriteAttempt::ClaimCreated);
        assert_eq!(WRITE_LADDER[2], WriteAttempt::InsertIfAbsent);
        assert_eq!(WRITE_LADDER[3], WriteAttempt::RetryMatchSession);
    }

    /// Store whose record writes never land, while reads report a live record
    /// Delegates to a memory store. Record writes can be dropped, and a full
    /// handover to another session can be committed right before the next
    /// matching write.
    struct ScriptedStore {
        inner: Arc<MemoryStateStore>,
        drop_writes: bool,
        handover: tokio::sync::Mutex<Option<(String, String, String)>>,
    }

    impl ScriptedStore {
        fn new(inner: MemoryStateStore, drop_writes: bool) -> Self {
            Self {
                inner: Arc::new(inner),
                drop_writes,
                handover: tokio::sync::Mutex::new(None),
            }
        }

        async fn arm_handover(&self, room: &str, peer: &str, session: &str) {
            *self.handover.lock().await =
                Some((room.to_string(), peer.to_string(), session.to_string()));
        }

        async fn before_write(&self) {
            let pending = self.handover.lock().await.take();
            if let Some((room, peer, session)) = pending {
                let other = SessionStateMachine::new(self.inner.clone());
                other.create_session(&room, &peer).await.unwrap();
                assert!(other.offer_received(&room, &peer, &session).await.unwrap());
                assert!(other.connected(&room, &peer, &session).await.unwrap());
            }
        }
    }

    #[async_trait]
    impl StateStore for ScriptedStore {
        async fn create_room(&self, room_id: &str) -> Result<(), StoreError> {
            self.inner.create_room(room_id).await
        }
        async fn get_latest_room_session(
            &self,
            room_id: &str,
        ) -> Result<Option<RoomSessionId>, StoreError> {
            self.inner.get_latest_room_session(room_id).await
        }
        async fn set_latest_room_session(
            &self,
            room_id: &str,
            room_session_id: &str,
        ) -> Result<(), StoreError> {
            self.inner.set_latest_room_session(room_id, room_session_id).await
        }
        async fn advance_latest_room_session(
            &self,
            room_id: &str,
            expected: Option<&str>,
            room_session_id: &str,
        ) -> Result<bool, StoreError> {
            self.inner
                .advance_latest_room_session(room_id, expected, room_session_id)
                .await
        }
        async fn is_brand_new(
            &self,
            room_id: &str,
            room_session_id: &str,
        ) -> Result<bool, StoreError> {
            self.inner.is_brand_new(room_id, room_session_id).await
        }
        async fn insert_placeholder(
            &self,
            room_id: &str,
            peer_id: &str,
        ) -> Result<u64, StoreError> {
            self.inner.insert_placeholder(room_id, peer_id).await
        }
        async fn conditional_update(&self, request: &UpsertRequest) -> Result<u64, StoreError> {
            if self.drop_writes {
                return Ok(0);
            }
            self.before_write().await;
            self.inner.conditional_update(request).await
        }
        async fn conditional_update_from_created(
            &self,
            request: &UpsertRequest,
        ) -> Result<u64, StoreError> {
            if self.drop_writes {
                return Ok(0);
            }
            self.inner.conditional_update_from_created(request).await
        }
        async fn insert_if_absent(&self, request: &UpsertRequest) -> Result<u64, StoreError> {
            if self.drop_writes {
                return Ok(0);
            }
            self.inner.insert_if_absent(request).await
        }
        async fn find_other_live_sessions(
            &self,
            room_id: &str,
            except: &str,
        ) -> Result<HashSet<RoomSessionId>, StoreError> {
            self.inner.find_other_live_sessions(room_id, except).await
        }
        async fn supersede_and_recreate(
            &self,
            room_id: &str,
            room_session_ids: &HashSet<RoomSessionId>,
            new_room_session_id: &str,
        ) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner
                .supersede_and_recreate(room_id, room_session_ids, new_room_session_id)
                .await
        }
        async fn get_record(
            &self,
            room_id: &str,
            peer_id: &str,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.get_record(room_id, peer_id).await
        }
    }

    #[tokio::test]
    async fn test_exhausted_ladder_is_fatal() {
        let store = Arc::new(ScriptedStore::new(MemoryStateStore::new(), true));
        let machine = SessionStateMachine::new(store);
        let room = generate_id();

        machine.create_session(&room, "p").await.unwrap();
        let result = machine.offer_received(&room, "p", "s1").await;
        match result {
            Err(SessionError::ConsistencyViolation { request }) => {
                assert_eq!(request.new_state, SessionState::FirstOfferReceived);
                assert_eq!(request.room_session_id, "s1");
            }
            other => panic!("expected consistency violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handover_mid_write_rejects_old_session() {
        for mode in [StoreMode::Locking, StoreMode::Optimistic] {
            let store = Arc::new(ScriptedStore::new(
                MemoryStateStore::with_config(StoreConfig {
                    mode,
                    latency: Duration::ZERO,
                }),
                false,
            ));
            let machine = SessionStateMachine::new(store.clone());
            let room = generate_id();

            machine.create_session(&room, "a").await.unwrap();
            assert!(machine.offer_received(&room, "a", "A").await.unwrap());
            assert!(machine.connected(&room, "a", "A").await.unwrap());

            // b moves the room to B after the A write passed its staleness check
            store.arm_handover(&room, "b", "B").await;
            assert!(!machine.disconnected(&room, "a", "A").await.unwrap());

            assert_eq!(
                store.get_latest_room_session(&room).await.unwrap().as_deref(),
                Some("B"),
                "mode {}",
                mode
            );
            assert!(state_of(&store.inner, &room, "a").await.is_placeholder());

            assert!(machine.connected(&room, "b", "B").await.unwrap());
            assert!(!machine.offer_received(&room, "a", "A").await.unwrap());
            assert!(machine.offer_received(&room, "a", "B").await.unwrap());
            assert_eq!(
                store.get_latest_room_session(&room).await.unwrap().as_deref(),
                Some("B")
            );
        }
    }

    #[tokio::test]
    async fn test_pointer_never_moves_back() {
        let (store, machine) = machine();
        machine.offer_received("r", "a", "A").await.unwrap();
        machine.offer_received("r", "b", "B").await.unwrap();

        // A write that saw pointer A loses to the committed B
        assert!(
            !store
                .advance_latest_room_session("r", Some("A"), "A")
                .await
                .unwrap()
        );
        assert!(
            store
                .advance_latest_room_session("r", Some("A"), "B")
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_latest_room_session("r").await.unwrap().as_deref(),
            Some("B")
        );
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let (_, machine) = machine();
        assert!(matches!(
            machine.offer_received("", "p", "s1").await,
            Err(SessionError::Store(StoreError::InvalidKey { .. }))
        ));
    }
}
