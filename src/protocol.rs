//! Room and participant model shared between the server and the client.
//!
//! The server owns every value in this module. The client only reads the
//! latest snapshot published by its [`RoomClient`](crate::RoomClient) and
//! requests changes through the client's operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for users.
pub type UserId = Uuid;

/// Unique identifier for rooms.
pub type RoomId = Uuid;

// ── Enums ───────────────────────────────────────────────────────────

/// State of a multiplayer room as reported by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultiplayerRoomState {
    /// The room is open and accepting state changes.
    #[default]
    Open,
    /// A match was started; participants are loading gameplay.
    WaitingForLoad,
    /// Gameplay is in progress.
    Playing,
    /// The room has been closed and will accept no further changes.
    Closed,
}

/// Per-user state within a multiplayer room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultiplayerUserState {
    #[default]
    Idle,
    Ready,
    WaitingForLoad,
    Loaded,
    Playing,
    FinishedPlay,
    Results,
    Spectating,
}

impl MultiplayerUserState {
    /// Whether the user is part of the match currently being played.
    pub fn is_playing(self) -> bool {
        matches!(self, Self::WaitingForLoad | Self::Loaded | Self::Playing)
    }
}

/// Local presence of the content a playlist item refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    Unknown,
    NotDownloaded,
    Downloading,
    Importing,
    LocallyAvailable,
}

// ── Structs ─────────────────────────────────────────────────────────

/// A user's beatmap availability, reported to the server so the host can see
/// who is able to play.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct BeatmapAvailability {
    pub state: DownloadState,
    /// Download progress in `0.0..=1.0`, only meaningful while downloading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<f32>,
}

impl BeatmapAvailability {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn not_downloaded() -> Self {
        Self::with_state(DownloadState::NotDownloaded)
    }

    pub fn downloading(progress: f32) -> Self {
        Self {
            state: DownloadState::Downloading,
            download_progress: Some(progress.clamp(0.0, 1.0)),
        }
    }

    pub fn importing() -> Self {
        Self::with_state(DownloadState::Importing)
    }

    pub fn locally_available() -> Self {
        Self::with_state(DownloadState::LocallyAvailable)
    }

    /// Returns `true` if the content can be played right now.
    pub fn is_locally_available(&self) -> bool {
        self.state == DownloadState::LocallyAvailable
    }

    fn with_state(state: DownloadState) -> Self {
        Self {
            state,
            download_progress: None,
        }
    }
}

/// A mod as the server stores it: an acronym plus its configured settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiMod {
    pub acronym: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl ApiMod {
    pub fn new(acronym: impl Into<String>) -> Self {
        Self {
            acronym: acronym.into(),
            settings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

/// A locally instantiated mod.
///
/// Settings are edited in place by the mod selection UI; those edits are
/// pushed to the server through a debounced update rather than one request
/// per change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mod {
    pub acronym: String,
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl Mod {
    pub fn new(acronym: impl Into<String>) -> Self {
        Self {
            acronym: acronym.into(),
            settings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

impl From<&ApiMod> for Mod {
    fn from(api: &ApiMod) -> Self {
        Self {
            acronym: api.acronym.clone(),
            settings: api.settings.clone(),
        }
    }
}

impl From<&Mod> for ApiMod {
    fn from(local: &Mod) -> Self {
        Self {
            acronym: local.acronym.clone(),
            settings: local.settings.clone(),
        }
    }
}

/// The beatmap currently selected for play in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistItem {
    pub id: u64,
    pub beatmap_id: u64,
    pub ruleset_id: u32,
    /// Mods every participant plays with.
    #[serde(default)]
    pub required_mods: Vec<ApiMod>,
    /// Mods participants may add on top of the required ones.
    #[serde(default)]
    pub allowed_mods: Vec<ApiMod>,
}

/// One participant of a multiplayer room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiplayerRoomUser {
    pub user_id: UserId,
    pub state: MultiplayerUserState,
    /// Mods the server has applied for this user, in addition to the
    /// playlist item's required mods.
    #[serde(default)]
    pub mods: Vec<ApiMod>,
    #[serde(default)]
    pub beatmap_availability: BeatmapAvailability,
}

impl MultiplayerRoomUser {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            state: MultiplayerUserState::Idle,
            mods: Vec::new(),
            beatmap_availability: BeatmapAvailability::unknown(),
        }
    }
}

/// Server-authoritative snapshot of a joined multiplayer room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiplayerRoom {
    pub room_id: RoomId,
    pub name: String,
    pub state: MultiplayerRoomState,
    /// The participant allowed to start the match.
    pub host: Option<UserId>,
    pub users: Vec<MultiplayerRoomUser>,
    /// Currently selected playlist item, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_item: Option<PlaylistItem>,
}

impl MultiplayerRoom {
    /// Look up a participant by id.
    pub fn user(&self, user_id: UserId) -> Option<&MultiplayerRoomUser> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    /// Participants taking part in the match currently being played.
    pub fn playing_users(&self) -> Vec<MultiplayerRoomUser> {
        self.users
            .iter()
            .filter(|u| u.state.is_playing())
            .cloned()
            .collect()
    }
}

/// The shared "current room" reference owned by the lobby.
///
/// A room that is still being created has no identifier yet. The reference
/// itself becoming `None` means the room went away for this client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Room {
    pub room_id: Option<RoomId>,
    pub name: String,
}

impl Room {
    /// A room that has not been created on the server yet.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            room_id: None,
            name: name.into(),
        }
    }

    /// A room the server has already created.
    pub fn created(room_id: RoomId, name: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id),
            name: name.into(),
        }
    }

    /// Screen title: `"New room"` until the server assigns an id.
    pub fn title(&self) -> &str {
        match self.room_id {
            Some(_) => &self.name,
            None => "New room",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn user(id: u128, state: MultiplayerUserState) -> MultiplayerRoomUser {
        MultiplayerRoomUser {
            state,
            ..MultiplayerRoomUser::new(Uuid::from_u128(id))
        }
    }

    #[test]
    fn playing_users_filters_by_state() {
        let room = MultiplayerRoom {
            room_id: Uuid::nil(),
            name: "room".into(),
            state: MultiplayerRoomState::Playing,
            host: None,
            users: vec![
                user(1, MultiplayerUserState::Playing),
                user(2, MultiplayerUserState::Spectating),
                user(3, MultiplayerUserState::Loaded),
                user(4, MultiplayerUserState::Idle),
                user(5, MultiplayerUserState::WaitingForLoad),
            ],
            playlist_item: None,
        };

        let ids: Vec<_> = room.playing_users().iter().map(|u| u.user_id).collect();
        assert_eq!(
            ids,
            vec![Uuid::from_u128(1), Uuid::from_u128(3), Uuid::from_u128(5)]
        );
    }

    #[test]
    fn title_depends_on_creation() {
        assert_eq!(Room::pending("lobby").title(), "New room");
        assert_eq!(Room::created(Uuid::nil(), "lobby").title(), "lobby");
    }

    #[test]
    fn downloading_progress_is_clamped() {
        assert_eq!(
            BeatmapAvailability::downloading(1.5).download_progress,
            Some(1.0)
        );
        assert!(!BeatmapAvailability::downloading(0.3).is_locally_available());
        assert!(BeatmapAvailability::locally_available().is_locally_available());
    }

    #[test]
    fn mod_conversion_keeps_settings() {
        let api = ApiMod::new("DT").with_setting("speed_change", serde_json::json!(1.3));
        let local = Mod::from(&api);
        assert_eq!(local.acronym, "DT");
        assert_eq!(local.settings["speed_change"], serde_json::json!(1.3));
        assert_eq!(ApiMod::from(&local), api);
    }

    #[test]
    fn user_state_uses_snake_case() {
        let json = serde_json::to_string(&MultiplayerUserState::WaitingForLoad).unwrap();
        assert_eq!(json, "\"waiting_for_load\"");
        let availability: BeatmapAvailability =
            serde_json::from_str(r#"{"state":"locally_available"}"#).unwrap();
        assert!(availability.is_locally_available());
    }
}
