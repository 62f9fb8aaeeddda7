use crate::session::state::RoomSessionId;
use crate::store::{StateStore, StoreError};
use std::sync::Arc;
use tracing::trace;

/// Outcome of the staleness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Writes may proceed. Carries the room pointer as read by the check.
    Live { pointer: Option<RoomSessionId> },
    Stale,
}

impl Liveness {
    pub fn is_live(&self) -> bool {
        matches!(self, Liveness::Live { .. })
    }
}

/// Decides whether an incoming room-session is the current one, a brand-new
/// epoch (handover), or a stale replay of a superseded epoch.
///
/// The brand-new check is best-effort: a concurrent insert can land between
/// the check and the write. The cascading write absorbs missed positives and
/// a false negative only costs one extra rejection.
#[derive(Clone)]
pub struct RoomSessionTracker {
    store: Arc<dyn StateStore>,
}

impl RoomSessionTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// True iff no record of the room, live or superseded, has ever
    /// referenced `room_session_id`
    pub async fn is_brand_new(
        &self,
        room_id: &str,
        room_session_id: &str,
    ) -> Result<bool, StoreError> {
        self.store.is_brand_new(room_id, room_session_id).await
    }

    /// Whether writes tagged `room_session_id` may proceed: the room has no
    /// pointer yet, the pointer matches, or the session was never seen before.
    pub async fn check(
        &self,
        room_id: &str,
        room_session_id: &str,
    ) -> Result<Liveness, StoreError> {
        let latest = self.store.get_latest_room_session(room_id).await?;
        if let Some(latest) = &latest
            && latest != room_session_id
        {
            let brand_new = self.is_brand_new(room_id, room_session_id).await?;
            trace!(
                "Room session {} differs from latest {}. brand new: {}",
                room_session_id, latest, brand_new
            );
            if !brand_new {
                return Ok(Liveness::Stale);
            }
        }
        Ok(Liveness::Live { pointer: latest })
    }

    pub async fn is_live(&self, room_id: &str, room_session_id: &str) -> Result<bool, StoreError> {
        Ok(self.check(room_id, room_session_id).await?.is_live())
    }

    /// Inverse of `is_live`, evaluated again right before each write
    pub async fn is_stale(&self, room_id: &str, room_session_id: &str) -> Result<bool, StoreError> {
        Ok(!self.is_live(room_id, room_session_id).await?)
    }
}
