#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for match session integration tests.
//!
//! Provides an in-memory [`MockRoomClient`] that records every request and
//! lets a test drive server pushes and connectivity, plus helpers for
//! building rooms and reading events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use match_session_client::error::Result;
use match_session_client::protocol::{
    ApiMod, BeatmapAvailability, MultiplayerRoom, MultiplayerRoomState, MultiplayerRoomUser,
    MultiplayerUserState, PlaylistItem, UserId,
};
use match_session_client::{ExitReason, MatchError, MatchEvent, RoomClient, RoomEvent};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

// ── MockRoomClient ──────────────────────────────────────────────────

/// A request the session sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomCall {
    UserMods(Vec<ApiMod>),
    Availability(BeatmapAvailability),
    State(MultiplayerUserState),
    StartMatch,
}

/// In-memory room client.
///
/// Requests are recorded in order. While the gate is closed every request
/// waits, which keeps tracked operations open for as long as a test needs.
pub struct MockRoomClient {
    room: StdMutex<Option<MultiplayerRoom>>,
    calls: StdMutex<Vec<RoomCall>>,
    /// Scripted `start_match` outcomes, consumed in order. `Ok(())` once empty.
    start_match_results: StdMutex<VecDeque<Result<()>>>,
    gate: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<RoomEvent>,
}

impl MockRoomClient {
    pub fn new(room: Option<MultiplayerRoom>) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        let (connected, _) = watch::channel(true);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            room: StdMutex::new(room),
            calls: StdMutex::new(Vec::new()),
            start_match_results: StdMutex::new(VecDeque::new()),
            gate,
            connected,
            events,
        })
    }

    /// Replace the room snapshot without notifying subscribers.
    pub fn set_room(&self, room: Option<MultiplayerRoom>) {
        *self.room.lock().unwrap() = room;
    }

    /// Replace the room snapshot and push `RoomUpdated`.
    pub fn push_room(&self, room: Option<MultiplayerRoom>) {
        self.set_room(room);
        let _ = self.events.send(RoomEvent::RoomUpdated);
    }

    /// Push `LoadRequested`.
    pub fn request_load(&self) {
        let _ = self.events.send(RoomEvent::LoadRequested);
    }

    pub fn disconnect(&self) {
        self.connected.send_replace(false);
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn script_start_match(&self, result: Result<()>) {
        self.start_match_results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<RoomCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&RoomCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Every `ChangeUserMods` request, in order.
    pub fn user_mod_calls(&self) -> Vec<Vec<ApiMod>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RoomCall::UserMods(mods) => Some(mods),
                _ => None,
            })
            .collect()
    }

    async fn request(&self, call: RoomCall) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RoomClient for MockRoomClient {
    fn room(&self) -> Option<MultiplayerRoom> {
        self.room.lock().unwrap().clone()
    }

    fn local_user_id(&self) -> Option<UserId> {
        Some(local_id())
    }

    fn connection_status(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    async fn change_user_mods(&self, mods: Vec<ApiMod>) -> Result<()> {
        self.request(RoomCall::UserMods(mods)).await;
        Ok(())
    }

    async fn change_beatmap_availability(&self, availability: BeatmapAvailability) -> Result<()> {
        self.request(RoomCall::Availability(availability)).await;
        Ok(())
    }

    async fn change_state(&self, state: MultiplayerUserState) -> Result<()> {
        self.request(RoomCall::State(state)).await;
        Ok(())
    }

    async fn start_match(&self) -> Result<()> {
        self.request(RoomCall::StartMatch).await;
        self.start_match_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

// ── Room builders ───────────────────────────────────────────────────

pub fn local_id() -> UserId {
    Uuid::from_u128(7)
}

pub fn playlist_item() -> PlaylistItem {
    PlaylistItem {
        id: 1,
        beatmap_id: 100,
        ruleset_id: 0,
        required_mods: vec![ApiMod::new("HD")],
        allowed_mods: vec![ApiMod::new("DA")],
    }
}

/// A room with the local user in `local_state`, optionally as host.
pub fn room_with(
    state: MultiplayerRoomState,
    local_state: MultiplayerUserState,
    local_is_host: bool,
) -> MultiplayerRoom {
    let mut local = MultiplayerRoomUser::new(local_id());
    local.state = local_state;
    MultiplayerRoom {
        room_id: Uuid::from_u128(1),
        name: "test room".into(),
        state,
        host: Some(if local_is_host {
            local_id()
        } else {
            Uuid::from_u128(99)
        }),
        users: vec![local],
        playlist_item: Some(playlist_item()),
    }
}

pub fn open_room(local_state: MultiplayerUserState) -> MultiplayerRoom {
    room_with(MultiplayerRoomState::Open, local_state, false)
}

/// A server error as a rejected request would carry it.
pub fn server_error(message: &str) -> MatchError {
    MatchError::ServerError {
        message: message.into(),
        error_code: None,
    }
}

// ── Tracing and event helpers ───────────────────────────────────────

/// Install a test subscriber honouring `RUST_LOG`. Safe to call from every
/// test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Receive the next event, failing the test after five seconds.
pub async fn next_event(rx: &mut mpsc::Receiver<MatchEvent>) -> MatchEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Receive events until one matches `predicate`.
pub async fn wait_for_event(
    rx: &mut mpsc::Receiver<MatchEvent>,
    predicate: impl Fn(&MatchEvent) -> bool,
) -> MatchEvent {
    loop {
        let event = next_event(rx).await;
        if predicate(&event) {
            return event;
        }
    }
}

/// Drain events through `Exited` and check that nothing follows it.
///
/// Returns the events before `Exited` and the exit reason.
pub async fn collect_until_exit(
    rx: &mut mpsc::Receiver<MatchEvent>,
) -> (Vec<MatchEvent>, ExitReason) {
    let mut before = Vec::new();
    loop {
        match next_event(rx).await {
            MatchEvent::Exited { reason } => {
                let trailing = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("event channel stayed open after Exited");
                assert!(trailing.is_none(), "event after Exited: {trailing:?}");
                return (before, reason);
            }
            event => before.push(event),
        }
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
