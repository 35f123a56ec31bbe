//! Abstraction over the connection to the multiplayer server.
//!
//! The [`RoomClient`] trait is the only way the match coordinator talks to the
//! server. It exposes the latest server-published room snapshot, the local
//! user's identity, a connectivity signal and a stream of push events, and it
//! accepts change requests as async operations.
//!
//! # Connection Setup
//!
//! Connecting, authenticating and joining a room are NOT part of this trait.
//! Hand an already connected client to
//! [`MatchSession::start`](crate::MatchSession::start).
//!
//! # Implementing a Room Client
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use match_session_client::error::Result;
//! use match_session_client::protocol::{
//!     ApiMod, BeatmapAvailability, MultiplayerRoom, MultiplayerUserState, UserId,
//! };
//! use match_session_client::room_client::{RoomClient, RoomEvent};
//! use tokio::sync::{broadcast, watch};
//!
//! struct MyClient { /* ... */ }
//!
//! #[async_trait]
//! impl RoomClient for MyClient {
//!     fn room(&self) -> Option<MultiplayerRoom> { todo!() }
//!     fn local_user_id(&self) -> Option<UserId> { todo!() }
//!     fn connection_status(&self) -> watch::Receiver<bool> { todo!() }
//!     fn subscribe(&self) -> broadcast::Receiver<RoomEvent> { todo!() }
//!
//!     async fn change_user_mods(&self, mods: Vec<ApiMod>) -> Result<()> { todo!() }
//!     async fn change_beatmap_availability(&self, availability: BeatmapAvailability) -> Result<()> { todo!() }
//!     async fn change_state(&self, state: MultiplayerUserState) -> Result<()> { todo!() }
//!     async fn start_match(&self) -> Result<()> { todo!() }
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::error::{MatchError, Result};
use crate::protocol::{
    ApiMod, BeatmapAvailability, MultiplayerRoom, MultiplayerRoomUser, MultiplayerUserState,
    UserId,
};

/// Notifications pushed by the server, delivered in the order received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    /// The room snapshot returned by [`RoomClient::room`] changed.
    RoomUpdated,
    /// The server asks every participant to load gameplay.
    LoadRequested,
}

/// Client-side view of a multiplayer server connection.
///
/// Accessors are synchronous and return the most recent state the server
/// published. Operations complete once the server has accepted or rejected
/// the request; accepted changes become visible through a later
/// [`RoomEvent::RoomUpdated`], never by the caller mutating the snapshot.
///
/// # Threading
///
/// Operations are spawned onto the tokio runtime, so implementations must be
/// `Send + Sync`. Their completions are reported back to the single session
/// loop that owns all coordinator state.
#[async_trait]
pub trait RoomClient: Send + Sync + 'static {
    /// Latest snapshot of the joined room, or `None` when not in a room.
    fn room(&self) -> Option<MultiplayerRoom>;

    /// Identity of the local user, if known.
    fn local_user_id(&self) -> Option<UserId>;

    /// Observable connectivity: `true` while connected to the server.
    fn connection_status(&self) -> watch::Receiver<bool>;

    /// Subscribe to push events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent>;

    /// The local user's entry in the current room.
    fn local_user(&self) -> Option<MultiplayerRoomUser> {
        let local_id = self.local_user_id()?;
        self.room()?.user(local_id).cloned()
    }

    /// Whether the local user is the room host.
    fn is_host(&self) -> bool {
        match (self.room(), self.local_user_id()) {
            (Some(room), Some(local_id)) => room.host == Some(local_id),
            _ => false,
        }
    }

    /// Replace the local user's extra mods.
    async fn change_user_mods(&self, mods: Vec<ApiMod>) -> Result<()>;

    /// Report the local availability of the selected beatmap.
    async fn change_beatmap_availability(&self, availability: BeatmapAvailability) -> Result<()>;

    /// Request a change of the local user's state.
    async fn change_state(&self, state: MultiplayerUserState) -> Result<()>;

    /// Ask the server to start the match. Host only.
    async fn start_match(&self) -> Result<()>;

    /// Toggle between `Idle` and `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NotInRoom`] without a local user in the room, and
    /// [`MatchError::InvalidStateChange`] when the local user is in any other
    /// state.
    async fn toggle_ready(&self) -> Result<()> {
        let Some(local_user) = self.local_user() else {
            return Err(MatchError::NotInRoom);
        };

        match local_user.state {
            MultiplayerUserState::Idle => self.change_state(MultiplayerUserState::Ready).await,
            MultiplayerUserState::Ready => self.change_state(MultiplayerUserState::Idle).await,
            from => Err(MatchError::InvalidStateChange {
                from,
                action: "toggle ready",
            }),
        }
    }

    /// Toggle between spectating and `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NotInRoom`] without a local user in the room, and
    /// [`MatchError::InvalidStateChange`] unless the local user is `Idle`,
    /// `Ready` or `Spectating`.
    async fn toggle_spectate(&self) -> Result<()> {
        let Some(local_user) = self.local_user() else {
            return Err(MatchError::NotInRoom);
        };

        match local_user.state {
            MultiplayerUserState::Idle | MultiplayerUserState::Ready => {
                self.change_state(MultiplayerUserState::Spectating).await
            }
            MultiplayerUserState::Spectating => {
                self.change_state(MultiplayerUserState::Idle).await
            }
            from => Err(MatchError::InvalidStateChange {
                from,
                action: "toggle spectate",
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::MultiplayerRoomState;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    /// Minimal client that records requested state changes.
    struct StateRecorder {
        room: MultiplayerRoom,
        local_id: UserId,
        changes: StdMutex<Vec<MultiplayerUserState>>,
        connected: watch::Sender<bool>,
        events: broadcast::Sender<RoomEvent>,
    }

    impl StateRecorder {
        fn with_local_state(state: MultiplayerUserState) -> Self {
            let local_id = Uuid::from_u128(7);
            let mut local = MultiplayerRoomUser::new(local_id);
            local.state = state;
            let (connected, _) = watch::channel(true);
            let (events, _) = broadcast::channel(8);
            Self {
                room: MultiplayerRoom {
                    room_id: Uuid::from_u128(1),
                    name: "room".into(),
                    state: MultiplayerRoomState::Open,
                    host: Some(local_id),
                    users: vec![local],
                    playlist_item: None,
                },
                local_id,
                changes: StdMutex::new(Vec::new()),
                connected,
                events,
            }
        }
    }

    #[async_trait]
    impl RoomClient for StateRecorder {
        fn room(&self) -> Option<MultiplayerRoom> {
            Some(self.room.clone())
        }

        fn local_user_id(&self) -> Option<UserId> {
            Some(self.local_id)
        }

        fn connection_status(&self) -> watch::Receiver<bool> {
            self.connected.subscribe()
        }

        fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
            self.events.subscribe()
        }

        async fn change_user_mods(&self, _mods: Vec<ApiMod>) -> Result<()> {
            Ok(())
        }

        async fn change_beatmap_availability(
            &self,
            _availability: BeatmapAvailability,
        ) -> Result<()> {
            Ok(())
        }

        async fn change_state(&self, state: MultiplayerUserState) -> Result<()> {
            self.changes.lock().unwrap().push(state);
            Ok(())
        }

        async fn start_match(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn toggle_ready_flips_between_idle_and_ready() {
        let idle = StateRecorder::with_local_state(MultiplayerUserState::Idle);
        idle.toggle_ready().await.unwrap();
        assert_eq!(*idle.changes.lock().unwrap(), [MultiplayerUserState::Ready]);

        let ready = StateRecorder::with_local_state(MultiplayerUserState::Ready);
        ready.toggle_ready().await.unwrap();
        assert_eq!(*ready.changes.lock().unwrap(), [MultiplayerUserState::Idle]);
    }

    #[tokio::test]
    async fn toggle_ready_rejects_other_states() {
        let playing = StateRecorder::with_local_state(MultiplayerUserState::Playing);
        let err = playing.toggle_ready().await.unwrap_err();
        assert!(matches!(
            err,
            MatchError::InvalidStateChange {
                from: MultiplayerUserState::Playing,
                ..
            }
        ));
        assert!(playing.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggle_spectate_transitions() {
        let ready = StateRecorder::with_local_state(MultiplayerUserState::Ready);
        ready.toggle_spectate().await.unwrap();
        assert_eq!(
            *ready.changes.lock().unwrap(),
            [MultiplayerUserState::Spectating]
        );

        let spectating = StateRecorder::with_local_state(MultiplayerUserState::Spectating);
        spectating.toggle_spectate().await.unwrap();
        assert_eq!(
            *spectating.changes.lock().unwrap(),
            [MultiplayerUserState::Idle]
        );

        let results = StateRecorder::with_local_state(MultiplayerUserState::Results);
        assert!(results.toggle_spectate().await.is_err());
    }

    #[tokio::test]
    async fn toggles_require_local_user_in_room() {
        let mut client = StateRecorder::with_local_state(MultiplayerUserState::Idle);
        client.room.users.clear();

        assert!(matches!(
            client.toggle_ready().await,
            Err(MatchError::NotInRoom)
        ));
        assert!(matches!(
            client.toggle_spectate().await,
            Err(MatchError::NotInRoom)
        ));
        assert!(client.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn default_accessors_resolve_local_user_and_host() {
        let client = StateRecorder::with_local_state(MultiplayerUserState::Ready);
        assert!(client.is_host());
        assert_eq!(
            client.local_user().map(|u| u.state),
            Some(MultiplayerUserState::Ready)
        );
    }
}
