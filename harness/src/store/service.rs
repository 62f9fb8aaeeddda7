//! StateStore trait definition

use async_trait::async_trait;
use std::collections::HashSet;

use super::types::StoreError;
use crate::session::state::{RoomSessionId, SessionRecord, UpsertRequest};

/// Keyed session storage with the atomic primitives the state machine needs.
///
/// Every method is a single atomic operation against the store; callers must
/// not assume any lock survives between two calls. Row-count results follow
/// SQL semantics: the number of records the statement changed (0 or 1).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Register a room with an unset session pointer. No-op if it exists.
    async fn create_room(&self, room_id: &str) -> Result<(), StoreError>;

    /// The latest accepted room-session for the room, if any
    async fn get_latest_room_session(
        &self,
        room_id: &str,
    ) -> Result<Option<RoomSessionId>, StoreError>;

    /// Point the room at `room_session_id`
    async fn set_latest_room_session(
        &self,
        room_id: &str,
        room_session_id: &str,
    ) -> Result<(), StoreError>;

    /// Move the pointer to `room_session_id` only if it is unset or still
    /// holds `expected`. True when the pointer holds `room_session_id` after
    /// the call; false when it moved on to another session.
    async fn advance_latest_room_session(
        &self,
        room_id: &str,
        expected: Option<&str>,
        room_session_id: &str,
    ) -> Result<bool, StoreError>;

    /// True when no record of this room, live or superseded, ever referenced
    /// `room_session_id`
    async fn is_brand_new(&self, room_id: &str, room_session_id: &str)
    -> Result<bool, StoreError>;

    /// Insert a CREATED placeholder record unless one exists
    async fn insert_placeholder(&self, room_id: &str, peer_id: &str) -> Result<u64, StoreError>;

    /// Advance the record matching (room, peer, room-session) whose state is
    /// one of `request.updated_states`.
    ///
    /// The three record writes below refuse a fenced request (see
    /// `UpsertRequest::fence`) once the room pointer names a third session.
    async fn conditional_update(&self, request: &UpsertRequest) -> Result<u64, StoreError>;

    /// Claim a CREATED record for (room, peer) regardless of its session id
    async fn conditional_update_from_created(
        &self,
        request: &UpsertRequest,
    ) -> Result<u64, StoreError>;

    /// Insert the requested record unless one exists for (room, peer)
    async fn insert_if_absent(&self, request: &UpsertRequest) -> Result<u64, StoreError>;

    /// Room-sessions other than `except` still referenced by live records
    async fn find_other_live_sessions(
        &self,
        room_id: &str,
        except: &str,
    ) -> Result<HashSet<RoomSessionId>, StoreError>;

    /// Overwrite every live record bound to one of `room_session_ids` with a
    /// CREATED placeholder, making room for `new_room_session_id`. Returns
    /// the superseded records as they were, marked ARCHIVED.
    async fn supersede_and_recreate(
        &self,
        room_id: &str,
        room_session_ids: &HashSet<RoomSessionId>,
        new_room_session_id: &str,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Read one record
    async fn get_record(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;
}
