use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Room identifier (opaque; UUID v4 string when generated by the harness)
pub type RoomId = String;

/// Peer identifier, scoped to a room
pub type PeerId = String;

/// Room-session (bridge session) identifier: one epoch of a room's media bridge
pub type RoomSessionId = String;

/// Generate a fresh opaque identifier for rooms, peers and room-sessions
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle state of a peer's session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    FirstOfferReceived,
    Connected,
    Disconnected,
    /// Room-session was superseded before the peer disconnected
    Archived,
}

impl SessionState {
    /// Progress rank within a room-session. Archived sits below Created so any
    /// live target replaces it.
    pub fn rank(self) -> u8 {
        match self {
            SessionState::Archived => 0,
            SessionState::Created => 1,
            SessionState::FirstOfferReceived => 2,
            SessionState::Connected => 3,
            SessionState::Disconnected => 4,
        }
    }

    /// The higher-ranked of `self` and `target`; used so a write never regresses.
    pub fn advance_to(self, target: SessionState) -> SessionState {
        if self.rank() > target.rank() {
            self
        } else {
            target
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::FirstOfferReceived => "FIRST_OFFER_RECEIVED",
            SessionState::Connected => "CONNECTED",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle timestamps in epoch milliseconds. A field is written once and
/// never overwritten afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimestamps {
    pub created_at: Option<u64>,
    pub first_offer_at: Option<u64>,
    pub connected_at: Option<u64>,
    pub disconnected_at: Option<u64>,
}

impl SessionTimestamps {
    /// Timestamps a write targeting `state` carries: every milestone up to and
    /// including the target's own, all stamped `now`.
    pub fn for_target(state: SessionState, now: u64) -> Self {
        let rank = state.rank();
        Self {
            created_at: Some(now),
            first_offer_at: (rank >= SessionState::FirstOfferReceived.rank()).then_some(now),
            connected_at: (rank >= SessionState::Connected.rank()).then_some(now),
            disconnected_at: (rank >= SessionState::Disconnected.rank()).then_some(now),
        }
    }

    /// Fill fields that are not yet set from `other`
    pub fn fill_from(&mut self, other: &SessionTimestamps) {
        self.created_at = self.created_at.or(other.created_at);
        self.first_offer_at = self.first_offer_at.or(other.first_offer_at);
        self.connected_at = self.connected_at.or(other.connected_at);
        self.disconnected_at = self.disconnected_at.or(other.disconnected_at);
    }
}

/// The persisted record for one (room, peer) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    /// `None` is the placeholder written by `create_session`
    pub room_session_id: Option<RoomSessionId>,
    pub state: SessionState,
    pub timestamps: SessionTimestamps,
}

impl SessionRecord {
    pub fn placeholder(room_id: &str, peer_id: &str, now: u64) -> Self {
        Self {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            room_session_id: None,
            state: SessionState::Created,
            timestamps: SessionTimestamps {
                created_at: Some(now),
                ..Default::default()
            },
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.room_session_id.is_none()
    }

    pub fn is_bound_to(&self, room_session_id: &str) -> bool {
        self.room_session_id.as_deref() == Some(room_session_id)
    }
}

/// One write of the cascading upsert: the target state, the states it may
/// advance from, and the timestamps to fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertRequest {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub room_session_id: RoomSessionId,
    pub new_state: SessionState,
    pub updated_states: &'static [SessionState],
    pub timestamps: SessionTimestamps,
    /// Room pointer seen by the staleness check. When set, the store refuses
    /// the write once the pointer has moved to a third session.
    pub fence: Option<Option<RoomSessionId>>,
}

impl UpsertRequest {
    pub fn new(
        room_id: &str,
        peer_id: &str,
        room_session_id: &str,
        new_state: SessionState,
        updated_states: &'static [SessionState],
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            room_session_id: room_session_id.to_string(),
            new_state,
            updated_states,
            timestamps: SessionTimestamps::for_target(new_state, now_millis()),
            fence: None,
        }
    }

    /// Fence the write on the pointer observed during the staleness check
    pub fn fenced(mut self, observed_pointer: Option<RoomSessionId>) -> Self {
        self.fence = Some(observed_pointer);
        self
    }

    /// Whether the current room pointer still admits this write
    pub fn admits_pointer(&self, pointer: Option<&str>) -> bool {
        let Some(observed) = &self.fence else {
            return true;
        };
        match pointer {
            None => true,
            Some(pointer) => {
                pointer == self.room_session_id || observed.as_deref() == Some(pointer)
            }
        }
    }

    /// Whether `record` is in one of the accepted predecessor states
    pub fn accepts(&self, record: &SessionRecord) -> bool {
        self.updated_states.contains(&record.state)
    }

    /// The fresh record `insert_if_absent` writes
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            room_id: self.room_id.clone(),
            peer_id: self.peer_id.clone(),
            room_session_id: Some(self.room_session_id.clone()),
            state: self.new_state,
            timestamps: self.timestamps,
        }
    }
}

/// Predecessor states for the first-offer write
pub const FIRST_OFFER_PREDECESSORS: &[SessionState] = &[
    SessionState::Created,
    SessionState::Archived,
    SessionState::FirstOfferReceived,
    SessionState::Connected,
];

/// Predecessor states for the connected write
pub const CONNECTED_PREDECESSORS: &[SessionState] = &[
    SessionState::Archived,
    SessionState::Created,
    SessionState::FirstOfferReceived,
    SessionState::Connected,
];

/// Predecessor states for the disconnected write
pub const DISCONNECTED_PREDECESSORS: &[SessionState] = &[
    SessionState::Archived,
    SessionState::Created,
    SessionState::FirstOfferReceived,
    SessionState::Connected,
    SessionState::Disconnected,
];
