//! Events emitted by a match session to the presentation layer.

use crate::protocol::{Mod, MultiplayerRoomUser, PlaylistItem};

/// Why a match session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The connection to the server was lost.
    Disconnected,
    /// The shared room reference went away (left, closed, or failed to join).
    RoomLost,
    /// The user navigated back, confirming if the room was live.
    UserRequested,
    /// The session handle was shut down or dropped.
    Shutdown,
}

/// Screen to push when gameplay starts.
#[derive(Debug, Clone, PartialEq)]
pub enum GameplayTarget {
    /// Play the selected item alongside the given users.
    Player {
        item: PlaylistItem,
        users: Vec<MultiplayerRoomUser>,
    },
    /// Watch the given users play.
    Spectator { users: Vec<MultiplayerRoomUser> },
}

/// A beatmap the host asked to present from outside the room screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatmapPresentation {
    pub beatmap_id: u64,
    pub ruleset_id: u32,
}

/// Events delivered through the receiver returned by
/// [`MatchSession::start`](crate::MatchSession::start).
///
/// [`Exited`](MatchEvent::Exited) is always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    /// The settings overlay was shown or hidden.
    SettingsVisibilityChanged { visible: bool },
    /// The room was created; the main room content can be revealed.
    MainContentShown,
    /// The selected playlist item changed.
    SelectedItemChanged { item: Option<PlaylistItem> },
    /// The effective mod set (server-confirmed user mods plus required mods)
    /// changed.
    ModsChanged { mods: Vec<Mod> },
    /// Gameplay is waiting for this screen to regain focus.
    FocusRequested,
    /// Gameplay is starting; push the target screen.
    GameplayStarted { target: GameplayTarget },
    /// The host asked to present a beatmap; open song selection for it.
    SongSelectRequested { beatmap: BeatmapPresentation },
    /// Leaving a live room needs a yes/no answer from the user.
    ExitConfirmationRequested,
    /// The session ended.
    Exited { reason: ExitReason },
}
