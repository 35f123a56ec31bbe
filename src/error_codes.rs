//! Structured rejection codes a multiplayer server attaches to failed room
//! operations.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings so a [`RoomClient`]
//! implementation can decode them straight from its transport.
//!
//! [`RoomClient`]: crate::RoomClient

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason a room operation was rejected by the server.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Membership errors
    NotJoinedRoom,
    RoomNotFound,
    UserBlocked,

    // Permission errors
    NotHost,

    // State errors
    InvalidStateChange,
    InvalidRoomState,
    MatchAlreadyStarted,
    NoUsersReady,

    // Content errors
    BeatmapNotAvailable,
    InvalidMods,

    // Server errors
    RateLimitExceeded,
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            // Membership errors
            Self::NotJoinedRoom => "You are not a participant of this room.",
            Self::RoomNotFound => {
                "The room could not be found. It may have been closed by its host."
            }
            Self::UserBlocked => "You are not allowed to perform actions in this room.",

            // Permission errors
            Self::NotHost => "Only the room host can perform this action.",

            // State errors
            Self::InvalidStateChange => {
                "Your current state does not allow this change. Wait for the room to update and try again."
            }
            Self::InvalidRoomState => {
                "The room is in an invalid state for this operation. Wait for the current match to finish."
            }
            Self::MatchAlreadyStarted => "The match has already been started.",
            Self::NoUsersReady => "The match cannot start until at least one user is ready.",

            // Content errors
            Self::BeatmapNotAvailable => {
                "The selected beatmap is not available locally. Download it before readying up."
            }
            Self::InvalidMods => {
                "One or more selected mods are not allowed for the current playlist item."
            }

            // Server errors
            Self::RateLimitExceeded => {
                "Too many requests in a short time. Please slow down and try again later."
            }
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
