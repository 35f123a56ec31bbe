//! Error types for the match session client.

use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::protocol::MultiplayerUserState;

/// Errors that can occur while coordinating a multiplayer match.
///
/// None of these cross into the presentation layer as data: a failed room
/// operation only re-enables the control that started it, and a lost
/// connection ends the session.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Attempted a room operation but the local user is not in a room.
    #[error("not in a room")]
    NotInRoom,

    /// The requested user state change is not valid from the current state.
    #[error("cannot {action} while in state {from:?}")]
    InvalidStateChange {
        /// State of the local user when the change was attempted.
        from: MultiplayerUserState,
        /// Short name of the attempted action (e.g. `"toggle ready"`).
        action: &'static str,
    },

    /// Another tracked operation is still in flight.
    #[error("another operation is already in progress")]
    OperationInProgress,

    /// The server rejected the request.
    #[error("server error: {message}")]
    ServerError {
        /// Human-readable error message from the server.
        message: String,
        /// Structured error code, if provided by the server.
        error_code: Option<ErrorCode>,
    },

    /// The match session loop has already exited.
    #[error("match session closed")]
    SessionClosed,
}

/// A specialized [`Result`] type for match session operations.
pub type Result<T> = std::result::Result<T, MatchError>;
