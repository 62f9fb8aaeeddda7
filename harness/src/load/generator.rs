//! Room lifecycle load generator
//!
//! Each cycle worker repeatedly plays one room through a join storm, a
//! session handover and an idle disconnect storm that overlaps the second
//! join storm, so offers for the old and new room-session race each other.

use crate::session::{PeerId, RoomId, SessionError, SessionStateMachine, generate_id};
use crate::store::{StateStore, StoreError};
use futures_util::future::join_all;
use indexmap::IndexSet;
use std::sync::atomic::Ordering;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, trace};

use super::report::{LoadCounters, LoadReport};

/// Errors that abandon a single cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Peer task failed: {0}")]
    Task(#[from] JoinError),

    #[error("No peer joined room {0}")]
    EmptyRoom(RoomId),
}

/// Load shape for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadConfig {
    /// Synthetic peers joining each room
    pub peers_per_room: usize,
    /// Wall-clock budget; workers stop starting cycles once it elapses
    pub duration: Duration,
    /// Concurrent cycle workers
    pub concurrency: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            peers_per_room: 10,
            duration: Duration::from_secs(30),
            concurrency: 8,
        }
    }
}

type PeerTask = JoinHandle<Result<(), SessionError>>;

/// One room being driven through a cycle
struct RoomRun {
    room_id: RoomId,
    peers: Vec<PeerId>,
    /// Peers that finished joining, in join order
    present: Mutex<IndexSet<PeerId>>,
    /// Fan-out re-offers not yet awaited
    hanging_offers: Mutex<Vec<PeerTask>>,
}

impl RoomRun {
    fn new(room_id: RoomId, peers_per_room: usize) -> Self {
        Self {
            room_id,
            peers: (0..peers_per_room).map(|_| generate_id()).collect(),
            present: Mutex::new(IndexSet::new()),
            hanging_offers: Mutex::new(Vec::new()),
        }
    }

    fn mark_present(&self, peer_id: &str) {
        self.present.lock().insert(peer_id.to_string());
    }

    fn present_peers(&self) -> Vec<PeerId> {
        self.present.lock().iter().cloned().collect()
    }

    fn clear_present(&self) {
        self.present.lock().clear();
    }

    fn push_hanging(&self, task: PeerTask) {
        self.hanging_offers.lock().push(task);
    }

    fn take_hanging(&self) -> Vec<PeerTask> {
        std::mem::take(&mut *self.hanging_offers.lock())
    }
}

/// Calls into the state machine, timed and tallied
#[derive(Clone)]
struct PeerDriver {
    machine: SessionStateMachine,
    counters: Arc<LoadCounters>,
}

impl PeerDriver {
    async fn offer(&self, room_id: &str, peer_id: &str, session: &str) -> Result<bool, SessionError> {
        let start = Instant::now();
        let accepted = self.machine.offer_received(room_id, peer_id, session).await?;
        self.counters.record_latency(start.elapsed());
        self.counters.offers.record(accepted);
        Ok(accepted)
    }

    async fn connect(&self, room_id: &str, peer_id: &str, session: &str) -> Result<bool, SessionError> {
        let start = Instant::now();
        let accepted = self.machine.connected(room_id, peer_id, session).await?;
        self.counters.record_latency(start.elapsed());
        self.counters.connects.record(accepted);
        Ok(accepted)
    }

    async fn disconnect(
        &self,
        room_id: &str,
        peer_id: &str,
        session: &str,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();
        let accepted = self.machine.disconnected(room_id, peer_id, session).await?;
        self.counters.record_latency(start.elapsed());
        self.counters.disconnects.record(accepted);
        Ok(accepted)
    }

    /// Create, offer, fan out re-offers to everyone already present, connect,
    /// then become present. Does not wait for its own fan-out.
    async fn join_peer(
        &self,
        room: &Arc<RoomRun>,
        peer_id: &str,
        session: &str,
    ) -> Result<(), SessionError> {
        self.machine.create_session(&room.room_id, peer_id).await?;
        self.offer(&room.room_id, peer_id, session).await?;

        self.offer_to_all(room, session);

        self.connect(&room.room_id, peer_id, session).await?;
        room.mark_present(peer_id);
        Ok(())
    }

    fn offer_to_all(&self, room: &Arc<RoomRun>, session: &str) {
        for present_peer in room.present_peers() {
            let driver = self.clone();
            let room_id = room.room_id.clone();
            let session = session.to_string();
            room.push_hanging(tokio::spawn(async move {
                driver.offer(&room_id, &present_peer, &session).await?;
                Ok(())
            }));
        }
    }
}

/// Drives concurrent room lifecycles against a state machine
#[derive(Clone)]
pub struct LoadGenerator {
    store: Arc<dyn StateStore>,
    driver: PeerDriver,
    config: LoadConfig,
}

impl LoadGenerator {
    pub fn new(store: Arc<dyn StateStore>, config: LoadConfig) -> Self {
        let machine = SessionStateMachine::new(Arc::clone(&store));
        Self {
            store,
            driver: PeerDriver {
                machine,
                counters: Arc::new(LoadCounters::default()),
            },
            config,
        }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Run `concurrency` cycle workers until the duration budget elapses
    pub async fn run(&self) -> LoadReport {
        let start = Instant::now();
        info!(
            "Launching {} cycle workers, {} peers per room, for {:?}",
            self.config.concurrency, self.config.peers_per_room, self.config.duration
        );

        let workers: Vec<_> = (0..self.config.concurrency)
            .map(|worker| {
                let generator = self.clone();
                tokio::spawn(async move {
                    while start.elapsed() < generator.config.duration {
                        generator.one_cycle(worker).await;
                    }
                })
            })
            .collect();

        for (worker, result) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!("Cycle worker {} stopped unexpectedly: {}", worker, e);
            }
        }

        self.driver.counters.report(start.elapsed())
    }

    /// Run one cycle; failures are logged and the cycle abandoned
    pub async fn one_cycle(&self, worker: usize) {
        let counters = &self.driver.counters;
        match self.run_cycle().await {
            Ok(()) => {
                counters.cycles_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.cycles_abandoned.fetch_add(1, Ordering::Relaxed);
                error!("Exception in test cycle on worker {}: {}", worker, e);
            }
        }
    }

    /// Snapshot of the counters so far
    pub fn report(&self, elapsed: Duration) -> LoadReport {
        self.driver.counters.report(elapsed)
    }

    async fn run_cycle(&self) -> Result<(), CycleError> {
        let room_id = generate_id();
        self.store.create_room(&room_id).await?;
        trace!("Running cycle with room: {}", room_id);
        let room = Arc::new(RoomRun::new(room_id, self.config.peers_per_room));

        let session_a = generate_id();
        self.everyone_joins(&room, &session_a).await?;

        // Handover: one peer moves to a session nobody else has seen yet
        let session_b = generate_id();
        let designated = room
            .present_peers()
            .into_iter()
            .next()
            .ok_or_else(|| CycleError::EmptyRoom(room.room_id.clone()))?;
        self.driver
            .offer(&room.room_id, &designated, &session_b)
            .await?;
        self.driver
            .connect(&room.room_id, &designated, &session_b)
            .await?;

        // Peers idling in session A now receive offers that must be rejected
        let all_disconnected = self.everyone_idly_disconnects(&room, &designated, &session_a);
        room.clear_present();

        let joined = self.everyone_joins(&room, &session_b).await;
        let disconnected = wait_all(all_disconnected).await;
        joined?;
        disconnected?;

        debug!("Cycle for room {} completed", room.room_id);
        Ok(())
    }

    /// Join storm: every peer joins concurrently; waits for the joins and all
    /// fan-out re-offers they spawned
    async fn everyone_joins(&self, room: &Arc<RoomRun>, session: &str) -> Result<(), CycleError> {
        let joins: Vec<PeerTask> = room
            .peers
            .iter()
            .map(|peer_id| {
                let driver = self.driver.clone();
                let room = Arc::clone(room);
                let peer_id = peer_id.clone();
                let session = session.to_string();
                tokio::spawn(async move { driver.join_peer(&room, &peer_id, &session).await })
            })
            .collect();

        let joined = wait_all(joins).await;
        let fanned_out = wait_all(room.take_hanging()).await;
        joined?;
        fanned_out
    }

    /// Every present peer except `skip` sends an offer and a disconnect for
    /// `session`, concurrently. Returns the task handles without awaiting.
    fn everyone_idly_disconnects(
        &self,
        room: &Arc<RoomRun>,
        skip: &str,
        session: &str,
    ) -> Vec<PeerTask> {
        room.present_peers()
            .into_iter()
            .filter(|peer_id| peer_id != skip)
            .map(|peer_id| {
                let driver = self.driver.clone();
                let room_id = room.room_id.clone();
                let session = session.to_string();
                tokio::spawn(async move {
                    driver.offer(&room_id, &peer_id, &session).await?;
                    driver.disconnect(&room_id, &peer_id, &session).await?;
                    Ok(())
                })
            })
            .collect()
    }
}

/// Await every handle, then surface the first failure
async fn wait_all(tasks: Vec<PeerTask>) -> Result<(), CycleError> {
    let mut first_error = None;
    for result in join_all(tasks).await {
        let outcome = match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => CycleError::from(e),
            Err(e) => CycleError::from(e),
        };
        first_error.get_or_insert(outcome);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
