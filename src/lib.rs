//! # Match Session Client
//!
//! Client-side match-state synchronization for multiplayer rooms.
//!
//! This crate reconciles what the local user does on a match screen (ready,
//! spectate, mod selection, beatmap availability, navigation) with what the
//! server pushes (room updates, gameplay load requests) and with
//! connectivity, and tells the presentation layer what to show next.
//!
//! ## Features
//!
//! - **Server-agnostic**: implement the [`RoomClient`] trait for any backend
//! - **Single-owner state**: every input is serialized onto one session loop
//! - **At most one operation**: ready/start/spectate clicks are tracked through
//!   the process-wide [`OperationTracker`]
//! - **Event-driven**: receive typed [`MatchEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use match_session_client::{MatchConfig, MatchEvent, MatchSession, OperationTracker};
//!
//! let tracker = OperationTracker::new();
//! let (mut session, mut events) = MatchSession::start(
//!     Arc::new(my_room_client),
//!     current_room_rx,
//!     tracker.clone(),
//!     MatchConfig::new(),
//! );
//!
//! session.ready_clicked()?;
//! while let Some(event) = events.recv().await {
//!     if let MatchEvent::Exited { reason } = event {
//!         println!("left the match: {reason:?}");
//!         break;
//!     }
//! }
//! ```

pub mod bindable;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod operation;
pub mod protocol;
pub mod room_client;
pub mod session;

// Re-export primary types for ergonomic imports.
pub use coordinator::{MatchCoordinator, Phase};
pub use error::MatchError;
pub use error_codes::ErrorCode;
pub use event::{BeatmapPresentation, ExitReason, GameplayTarget, MatchEvent};
pub use operation::{OperationToken, OperationTracker};
pub use protocol::{BeatmapAvailability, Mod, MultiplayerRoom, Room};
pub use room_client::{RoomClient, RoomEvent};
pub use session::{MatchConfig, MatchSession};
