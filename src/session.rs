//! Async driver for a [`MatchCoordinator`].
//!
//! [`MatchSession`] is a thin handle that forwards presentation input to a
//! background session loop over an unbounded MPSC channel. The loop owns the
//! coordinator and is the only place its state changes: commands, server
//! pushes, connectivity changes, operation completions and the mod settings
//! debounce timer are all multiplexed onto it with `tokio::select!`. Events
//! are emitted on a bounded channel returned from [`MatchSession::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let (session, mut events) = MatchSession::start(
//!     Arc::clone(&room_client),
//!     current_room.subscribe(),
//!     tracker.clone(),
//!     MatchConfig::new(),
//! );
//!
//! session.set_beatmap_availability(BeatmapAvailability::locally_available())?;
//! session.ready_clicked()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MatchEvent::GameplayStarted { target } => { /* push gameplay */ }
//!         MatchEvent::Exited { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::coordinator::{Completion, MatchCoordinator};
use crate::debounce::DEFAULT_MOD_SETTINGS_DEBOUNCE;
use crate::error::{MatchError, Result};
use crate::event::{BeatmapPresentation, ExitReason, MatchEvent};
use crate::operation::OperationTracker;
use crate::protocol::{BeatmapAvailability, Mod, Room};
use crate::room_client::{RoomClient, RoomEvent};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default cap on users shown when spectating a match.
pub const DEFAULT_MAX_SPECTATED_PLAYERS: usize = 16;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`MatchSession`].
///
/// # Example
///
/// ```
/// use match_session_client::session::MatchConfig;
/// use std::time::Duration;
///
/// let config = MatchConfig::new()
///     .with_mod_settings_debounce(Duration::from_millis(250))
///     .with_event_channel_capacity(512);
/// assert_eq!(config.max_spectated_players, 16);
/// ```
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// How long mod setting edits must settle before they are sent.
    ///
    /// Defaults to **500 ms**.
    pub mod_settings_debounce: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged). The final `Exited` event is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the session loop is given to wind down on
    /// [`MatchSession::shutdown`] before its task is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Maximum number of users watched at once when spectating.
    ///
    /// Defaults to **16**. Values below 1 are clamped to 1.
    pub max_spectated_players: usize,
    /// Beatmap availability known when the session starts.
    pub initial_availability: BeatmapAvailability,
}

impl MatchConfig {
    pub fn new() -> Self {
        Self {
            mod_settings_debounce: DEFAULT_MOD_SETTINGS_DEBOUNCE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_spectated_players: DEFAULT_MAX_SPECTATED_PLAYERS,
            initial_availability: BeatmapAvailability::unknown(),
        }
    }

    #[must_use]
    pub fn with_mod_settings_debounce(mut self, delay: Duration) -> Self {
        self.mod_settings_debounce = delay;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_spectated_players(mut self, max: usize) -> Self {
        self.max_spectated_players = max.max(1);
        self
    }

    #[must_use]
    pub fn with_initial_availability(mut self, availability: BeatmapAvailability) -> Self {
        self.initial_availability = availability;
        self
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// Presentation input queued to the session loop.
#[derive(Debug)]
enum Command {
    ReadyClicked,
    SpectateClicked,
    SetUserMods(Vec<Mod>),
    ChangeModSetting {
        acronym: String,
        key: String,
        value: serde_json::Value,
    },
    SetBeatmapAvailability(BeatmapAvailability),
    SetSettingsVisible(bool),
    FocusChanged(bool),
    PresentBeatmap(BeatmapPresentation),
    BackRequested,
    ConfirmExit,
    DeclineExit,
}

// ── Session handle ──────────────────────────────────────────────────

/// Handle to a running match session.
///
/// All input methods queue a command and return immediately. They fail with
/// [`MatchError::SessionClosed`] once the session has exited.
pub struct MatchSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Cleared by the session loop when it exits.
    running: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl MatchSession {
    /// Enter a match: subscribe to the room client and spawn the session loop.
    ///
    /// # Arguments
    ///
    /// * `client`: A connected [`RoomClient`].
    /// * `current_room`: Read-only view of the shared current-room reference.
    ///   The session never writes it; the reference becoming `None` ends the
    ///   session.
    /// * `tracker`: The process-wide [`OperationTracker`].
    /// * `config`: Session configuration.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start<C: RoomClient>(
        client: Arc<C>,
        current_room: watch::Receiver<Option<Room>>,
        tracker: OperationTracker,
        config: MatchConfig,
    ) -> (Self, mpsc::Receiver<MatchEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<MatchEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));

        // Subscribe before spawning so no push is missed in between.
        let subscriptions = Subscriptions::subscribe(client.as_ref(), current_room);
        let (coordinator, completion_rx) =
            MatchCoordinator::new(client, tracker, &config, event_tx.clone());

        let task = tokio::spawn(session_loop(
            coordinator,
            subscriptions,
            SessionChannels {
                cmd_rx,
                completion_rx,
                shutdown_rx,
                event_tx,
            },
            Arc::clone(&running),
        ));

        let session = Self {
            cmd_tx,
            running,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (session, event_rx)
    }

    // ── Public API methods ──────────────────────────────────────────

    /// The ready (or host start) button was clicked.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn ready_clicked(&self) -> Result<()> {
        self.send(Command::ReadyClicked)
    }

    /// The spectate button was clicked.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn spectate_clicked(&self) -> Result<()> {
        self.send(Command::SpectateClicked)
    }

    /// The user picked a new set of extra mods.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn set_user_mods(&self, mods: Vec<Mod>) -> Result<()> {
        self.send(Command::SetUserMods(mods))
    }

    /// The user edited a setting of one of the selected mods.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn change_mod_setting(
        &self,
        acronym: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        self.send(Command::ChangeModSetting {
            acronym: acronym.into(),
            key: key.into(),
            value,
        })
    }

    /// Local presence of the selected beatmap changed.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn set_beatmap_availability(&self, availability: BeatmapAvailability) -> Result<()> {
        self.send(Command::SetBeatmapAvailability(availability))
    }

    /// The settings overlay was shown or hidden.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn set_settings_visible(&self, visible: bool) -> Result<()> {
        self.send(Command::SetSettingsVisible(visible))
    }

    /// Open the settings overlay (room header button).
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn show_settings(&self) -> Result<()> {
        self.set_settings_visible(true)
    }

    /// The match screen gained or lost focus.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn focus_changed(&self, focused: bool) -> Result<()> {
        self.send(Command::FocusChanged(focused))
    }

    /// A beatmap was picked outside the room screen.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn present_beatmap(&self, beatmap: BeatmapPresentation) -> Result<()> {
        self.send(Command::PresentBeatmap(beatmap))
    }

    /// The user navigated back.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn back_requested(&self) -> Result<()> {
        self.send(Command::BackRequested)
    }

    /// The user accepted the exit confirmation prompt.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn confirm_exit(&self) -> Result<()> {
        self.send(Command::ConfirmExit)
    }

    /// The user declined the exit confirmation prompt.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::SessionClosed`] if the session has exited.
    pub fn decline_exit(&self) -> Result<()> {
        self.send(Command::DeclineExit)
    }

    /// Leave the match and stop the session loop.
    ///
    /// The event receiver yields a final `Exited` event and then `None`.
    pub async fn shutdown(&mut self) {
        debug!("MatchSession: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the loop with a timeout. If it doesn't exit in time, abort it
        // so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Returns `true` until the session loop has exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn send(&self, command: Command) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(MatchError::SessionClosed);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| MatchError::SessionClosed)
    }
}

impl std::fmt::Debug for MatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchSession")
            .field("running", &self.is_running())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for MatchSession {
    fn drop(&mut self) {
        // Drop cannot await the graceful path; abort the loop instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

/// Listeners registered with the room client and the shared room reference.
/// Dropping them unsubscribes.
struct Subscriptions {
    room_events: broadcast::Receiver<RoomEvent>,
    connection: watch::Receiver<bool>,
    current_room: watch::Receiver<Option<Room>>,
}

impl Subscriptions {
    fn subscribe<C: RoomClient>(client: &C, current_room: watch::Receiver<Option<Room>>) -> Self {
        Self {
            room_events: client.subscribe(),
            connection: client.connection_status(),
            current_room,
        }
    }
}

/// Channels owned by the session loop.
struct SessionChannels {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    shutdown_rx: oneshot::Receiver<()>,
    event_tx: mpsc::Sender<MatchEvent>,
}

/// Background loop that serializes every input of one match session.
///
/// Exits when the coordinator decides to leave: disconnection, loss of the
/// current room, a confirmed back navigation, a shutdown request or the
/// handle being dropped.
async fn session_loop<C: RoomClient>(
    mut coordinator: MatchCoordinator<C>,
    mut subscriptions: Subscriptions,
    channels: SessionChannels,
    running: Arc<AtomicBool>,
) {
    let SessionChannels {
        mut cmd_rx,
        mut completion_rx,
        mut shutdown_rx,
        event_tx,
    } = channels;

    debug!("session loop started");

    // The observed signals apply immediately, as if they had just changed.
    let connected = *subscriptions.connection.borrow_and_update();
    coordinator.on_connection_changed(connected);
    if subscriptions.current_room.borrow_and_update().is_none() {
        coordinator.on_current_room_lost();
    }
    coordinator.enter();

    while !coordinator.is_exiting() {
        tokio::select! {
            // Connectivity outranks everything but an explicit shutdown.
            biased;

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                coordinator.exit(ExitReason::Shutdown);
            }

            changed = subscriptions.connection.changed() => {
                let connected = changed.is_ok() && *subscriptions.connection.borrow_and_update();
                coordinator.on_connection_changed(connected);
            }

            changed = subscriptions.current_room.changed() => {
                if changed.is_err() || subscriptions.current_room.borrow_and_update().is_none() {
                    coordinator.on_current_room_lost();
                }
            }

            event = subscriptions.room_events.recv() => {
                match event {
                    Ok(RoomEvent::RoomUpdated) => coordinator.on_room_updated(),
                    Ok(RoomEvent::LoadRequested) => coordinator.on_load_requested(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("missed {skipped} room events; refreshing from the latest room state");
                        coordinator.on_room_updated();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("room event stream closed");
                        coordinator.on_connection_changed(false);
                    }
                }
            }

            Some(completion) = completion_rx.recv() => {
                coordinator.on_operation_completed(completion);
            }

            mods = coordinator.mod_settings_settled() => {
                coordinator.on_mod_settings_settled(mods);
            }

            command = cmd_rx.recv() => {
                match command {
                    Some(command) => handle_command(&mut coordinator, command),
                    // Command channel closed, the session handle was dropped.
                    None => {
                        debug!("command channel closed, leaving match");
                        coordinator.exit(ExitReason::Shutdown);
                    }
                }
            }
        }
    }

    drop(subscriptions);
    let reason = coordinator.exit_reason().unwrap_or(ExitReason::Shutdown);
    coordinator.dispose();
    running.store(false, Ordering::Release);

    // `Exited` is the last event and must never be dropped.
    if event_tx.send(MatchEvent::Exited { reason }).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }

    debug!(?reason, "session loop exited");
}

fn handle_command<C: RoomClient>(coordinator: &mut MatchCoordinator<C>, command: Command) {
    match command {
        Command::ReadyClicked => coordinator.on_ready_clicked(),
        Command::SpectateClicked => coordinator.on_spectate_clicked(),
        Command::SetUserMods(mods) => coordinator.set_user_mods(mods),
        Command::ChangeModSetting {
            acronym,
            key,
            value,
        } => coordinator.change_mod_setting(&acronym, key, value),
        Command::SetBeatmapAvailability(availability) => {
            coordinator.set_beatmap_availability(availability);
        }
        Command::SetSettingsVisible(visible) => coordinator.set_settings_visible(visible),
        Command::FocusChanged(focused) => coordinator.on_focus_changed(focused),
        Command::PresentBeatmap(beatmap) => coordinator.present_beatmap(beatmap),
        Command::BackRequested => coordinator.on_back_requested(),
        Command::ConfirmExit => coordinator.on_exit_confirmed(),
        Command::DeclineExit => coordinator.on_exit_declined(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
