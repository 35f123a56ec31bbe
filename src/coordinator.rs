//! The match coordinator: reconciles user intent, server pushes and
//! connectivity into one local view of the room.
//!
//! [`MatchCoordinator`] is a synchronous state machine. Every method runs on
//! the single session loop (see [`crate::session`]); room operations are
//! spawned onto the runtime and their outcomes come back as [`Completion`]s
//! through the channel returned by [`MatchCoordinator::new`], so no two
//! handlers ever touch coordinator state at the same time.
//!
//! # Phases
//!
//! ```text
//! AwaitingRoom ──room + settings hidden──▶ InRoom ──load requested──▶ AwaitingGameplayLoad
//!       │                             ▲                               │
//!       │                             └──────── gameplay started ─────┘
//!       └───────────── any phase ──exit──▶ Exiting ──dispose──▶ Disposed
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bindable::{Bindable, ValueChanged};
use crate::debounce::ModSettingDebouncer;
use crate::error::Result;
use crate::event::{BeatmapPresentation, ExitReason, GameplayTarget, MatchEvent};
use crate::operation::{OperationId, OperationToken, OperationTracker};
use crate::protocol::{
    ApiMod, BeatmapAvailability, Mod, MultiplayerRoomState, MultiplayerUserState, PlaylistItem,
};
use crate::room_client::RoomClient;
use crate::session::MatchConfig;

// ── Phases and completions ──────────────────────────────────────────

/// Lifecycle phase of a [`MatchCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The room is still being created; the settings overlay is in front.
    AwaitingRoom,
    /// Normal interaction with a created room.
    InRoom,
    /// The server requested gameplay load; waiting for screen focus.
    AwaitingGameplayLoad,
    /// Exit decided; cleanup pending.
    Exiting,
    /// Listeners released. Terminal.
    Disposed,
}

/// Tracked room operations started by a button click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedAction {
    StartMatch,
    ToggleReady,
    ToggleSpectate,
}

/// Outcome of a tracked operation, delivered back to the session loop.
#[derive(Debug)]
pub struct Completion {
    pub operation: OperationId,
    pub action: TrackedAction,
    pub result: Result<()>,
}

/// Untracked requests, sent one at a time in the order they were queued.
/// Failures are logged; the next server update corrects any divergence.
#[derive(Debug)]
enum RoomRequest {
    ChangeUserMods(Vec<ApiMod>),
    ChangeBeatmapAvailability(BeatmapAvailability),
    ChangeState(MultiplayerUserState),
}

// ── Coordinator ─────────────────────────────────────────────────────

/// Client-side coordinator for one multiplayer match screen.
pub struct MatchCoordinator<C: RoomClient> {
    client: Arc<C>,
    tracker: OperationTracker,
    phase: Phase,
    event_tx: mpsc::Sender<MatchEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    request_tx: mpsc::UnboundedSender<RoomRequest>,
    max_spectated_players: usize,

    selected_item: Bindable<Option<PlaylistItem>>,
    /// Extra mods chosen locally.
    user_mods: Bindable<Vec<Mod>>,
    /// Effective mods as confirmed by the server.
    mods: Bindable<Vec<Mod>>,
    beatmap_availability: Bindable<BeatmapAvailability>,
    settings_visible: Bindable<bool>,

    /// Open while a ready, start or spectate click awaits its outcome.
    ready_operation: Option<OperationToken>,
    mod_settings: ModSettingDebouncer<Vec<Mod>>,
    /// Whether in-place setting edits of `user_mods` are forwarded.
    tracking_mod_settings: bool,

    connected: bool,
    has_focus: bool,
    load_deferred: bool,
    awaiting_focus: bool,
    exit_confirmed: bool,
    confirmation_pending: bool,
    exit_reason: Option<ExitReason>,
}

impl<C: RoomClient> MatchCoordinator<C> {
    /// Create a coordinator and the receiver its operation completions
    /// arrive on.
    ///
    /// Starts in [`Phase::AwaitingRoom`] when the client has no room yet.
    /// Spawns the worker that forwards untracked room requests, so this must
    /// be called from within a tokio runtime.
    pub fn new(
        client: Arc<C>,
        tracker: OperationTracker,
        config: &MatchConfig,
        event_tx: mpsc::Sender<MatchEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        tokio::spawn(request_worker(Arc::clone(&client), request_rx));
        let awaiting_room = client.room().is_none();

        let mut selected_item = Bindable::new(None);
        let tx = event_tx.clone();
        selected_item.observe(move |change: &ValueChanged<Option<PlaylistItem>>| {
            emit_event(
                &tx,
                MatchEvent::SelectedItemChanged {
                    item: change.new.clone(),
                },
            );
        });

        let mut mods = Bindable::new(Vec::new());
        let tx = event_tx.clone();
        mods.observe(move |change: &ValueChanged<Vec<Mod>>| {
            emit_event(
                &tx,
                MatchEvent::ModsChanged {
                    mods: change.new.clone(),
                },
            );
        });

        let mut settings_visible = Bindable::new(awaiting_room);
        let tx = event_tx.clone();
        settings_visible.observe(move |change: &ValueChanged<bool>| {
            emit_event(
                &tx,
                MatchEvent::SettingsVisibilityChanged {
                    visible: change.new,
                },
            );
        });

        let coordinator = Self {
            client,
            tracker,
            phase: if awaiting_room {
                Phase::AwaitingRoom
            } else {
                Phase::InRoom
            },
            event_tx,
            completion_tx,
            request_tx,
            max_spectated_players: config.max_spectated_players,
            selected_item,
            user_mods: Bindable::new(Vec::new()),
            mods,
            beatmap_availability: Bindable::new(config.initial_availability),
            settings_visible,
            ready_operation: None,
            mod_settings: ModSettingDebouncer::new(config.mod_settings_debounce),
            tracking_mod_settings: false,
            connected: true,
            has_focus: true,
            load_deferred: false,
            awaiting_focus: false,
            exit_confirmed: false,
            confirmation_pending: false,
            exit_reason: None,
        };

        (coordinator, completion_rx)
    }

    // ── State accessors ─────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns `true` once an exit has been decided.
    pub fn is_exiting(&self) -> bool {
        matches!(self.phase, Phase::Exiting | Phase::Disposed)
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason
    }

    /// Returns `true` while a ready/start/spectate click awaits its outcome.
    pub fn has_pending_operation(&self) -> bool {
        self.ready_operation.is_some()
    }

    pub fn selected_item(&self) -> Option<&PlaylistItem> {
        self.selected_item.value().as_ref()
    }

    pub fn user_mods(&self) -> &[Mod] {
        self.user_mods.value()
    }

    pub fn mods(&self) -> &[Mod] {
        self.mods.value()
    }

    pub fn beatmap_availability(&self) -> BeatmapAvailability {
        *self.beatmap_availability.value()
    }

    pub fn settings_visible(&self) -> bool {
        *self.settings_visible.value()
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Apply the initial values of the local bindings.
    ///
    /// Reports the current beatmap availability and derives the selected
    /// item and effective mods from the room as it is right now.
    pub fn enter(&mut self) {
        if self.is_exiting() {
            return;
        }

        debug!(phase = ?self.phase, "entering match");
        if self.phase == Phase::AwaitingRoom {
            emit_event(
                &self.event_tx,
                MatchEvent::SettingsVisibilityChanged { visible: true },
            );
        }

        if self.client.room().is_some() {
            self.send_request(RoomRequest::ChangeBeatmapAvailability(
                *self.beatmap_availability.value(),
            ));
        }
        self.on_room_updated();
    }

    /// Decide to leave the match. Only the first call has any effect.
    pub fn exit(&mut self, reason: ExitReason) {
        if self.is_exiting() {
            return;
        }

        debug!(?reason, phase = ?self.phase, "exiting match");
        self.phase = Phase::Exiting;
        self.exit_reason = Some(reason);
        self.confirmation_pending = false;
    }

    /// Release everything the coordinator holds. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.phase == Phase::Disposed {
            return;
        }

        self.mod_settings.cancel();
        self.tracking_mod_settings = false;
        self.release_ready_operation();
        self.selected_item.clear_observers();
        self.mods.clear_observers();
        self.settings_visible.clear_observers();
        self.phase = Phase::Disposed;
        debug!("match coordinator disposed");
    }

    // ── Server pushes and connectivity ──────────────────────────────

    /// The room snapshot changed.
    pub fn on_room_updated(&mut self) {
        if self.is_exiting() {
            return;
        }

        let room = self.client.room();
        let room_open = room
            .as_ref()
            .is_none_or(|room| room.state == MultiplayerRoomState::Open);

        self.selected_item
            .set(room.and_then(|room| room.playlist_item));

        // The match was aborted before this client could load it.
        if room_open {
            if self.load_deferred {
                debug!("room reopened; dropping deferred gameplay load");
                self.load_deferred = false;
            }
            if self.phase == Phase::AwaitingGameplayLoad {
                self.awaiting_focus = false;
                self.phase = Phase::InRoom;
            }
        }

        self.update_mods();
        self.reveal_main_content();
    }

    /// Recompute the effective mods from the server's view of the local user.
    ///
    /// The server is authoritative here: local mod edits made while a match
    /// is being started must not diverge from what the server will apply.
    pub fn update_mods(&mut self) {
        let Some(item) = self.selected_item.value().as_ref() else {
            return;
        };
        let Some(local_user) = self.client.local_user() else {
            return;
        };

        let mods: Vec<Mod> = local_user
            .mods
            .iter()
            .map(Mod::from)
            .chain(item.required_mods.iter().map(Mod::from))
            .collect();
        self.mods.set(mods);
    }

    /// The server asked every participant to load gameplay.
    pub fn on_load_requested(&mut self) {
        if self.is_exiting() {
            return;
        }

        if !self.beatmap_availability.value().is_locally_available() {
            debug!(
                availability = ?self.beatmap_availability.value().state,
                "load requested without local content; deferring"
            );
            self.load_deferred = true;
            return;
        }

        self.load_deferred = false;
        self.phase = Phase::AwaitingGameplayLoad;
        self.try_start_gameplay();
    }

    /// Screen focus was gained or lost.
    ///
    /// A gameplay load waiting for focus is retried once on the next gain.
    pub fn on_focus_changed(&mut self, focused: bool) {
        self.has_focus = focused;
        if focused && self.awaiting_focus && self.phase == Phase::AwaitingGameplayLoad {
            self.try_start_gameplay();
        }
    }

    pub fn on_connection_changed(&mut self, connected: bool) {
        self.connected = connected;
        if !connected {
            self.exit(ExitReason::Disconnected);
        }
    }

    /// The shared current-room reference became empty.
    pub fn on_current_room_lost(&mut self) {
        self.exit(ExitReason::RoomLost);
    }

    /// A tracked operation finished.
    pub fn on_operation_completed(&mut self, completion: Completion) {
        let held = self.ready_operation.as_ref().map(OperationToken::id);
        if held != Some(completion.operation) {
            debug!(
                operation = %completion.operation,
                action = ?completion.action,
                "ignoring completion of an operation that is no longer held"
            );
            return;
        }

        match (completion.action, completion.result) {
            (TrackedAction::StartMatch, Ok(())) => {
                // Released by the load request that follows.
                debug!("match start accepted");
            }
            (action, Err(e)) => {
                debug!(?action, "operation failed: {e}");
                self.release_ready_operation();
            }
            (_, Ok(())) => self.release_ready_operation(),
        }
    }

    // ── User actions ────────────────────────────────────────────────

    /// Ready button: start the match as host, otherwise toggle readiness.
    pub fn on_ready_clicked(&mut self) {
        let Some(operation) = self.begin_ready_operation("ready") else {
            return;
        };

        let local_state = self.client.local_user().map(|user| user.state);
        let can_start = matches!(
            local_state,
            Some(MultiplayerUserState::Ready | MultiplayerUserState::Spectating)
        );

        if self.client.is_host() && can_start {
            self.spawn_tracked(operation, TrackedAction::StartMatch);
        } else {
            self.spawn_tracked(operation, TrackedAction::ToggleReady);
        }
    }

    pub fn on_spectate_clicked(&mut self) {
        if let Some(operation) = self.begin_ready_operation("spectate") {
            self.spawn_tracked(operation, TrackedAction::ToggleSpectate);
        }
    }

    /// Replace the locally chosen extra mods.
    pub fn set_user_mods(&mut self, mods: Vec<Mod>) {
        if self.is_exiting() {
            return;
        }

        if self.user_mods.set(mods).is_none() {
            return;
        }

        // The new set is sent in full; a pending settings update is stale.
        self.tracking_mod_settings = false;
        self.mod_settings.cancel();

        if self.client.room().is_none() {
            return;
        }

        self.send_request(RoomRequest::ChangeUserMods(to_api_mods(
            self.user_mods.value(),
        )));
        self.tracking_mod_settings = true;
    }

    /// Edit one setting of a selected mod in place.
    ///
    /// The update reaches the server once edits have settled for the
    /// configured debounce delay.
    pub fn change_mod_setting(
        &mut self,
        acronym: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        if self.is_exiting() || !self.tracking_mod_settings {
            return;
        }

        let key = key.into();
        let changed = self.user_mods.edit_in_place(|mods| {
            let Some(target) = mods.iter_mut().find(|m| m.acronym == acronym) else {
                return false;
            };
            target.settings.insert(key, value.clone()) != Some(value)
        });

        if changed {
            self.mod_settings.arm(self.user_mods.value().clone());
        }
    }

    /// Resolves when a debounced mod settings update is due.
    pub async fn mod_settings_settled(&mut self) -> Vec<Mod> {
        self.mod_settings.fired().await
    }

    /// Send the settled mod settings, unless the room is gone by now.
    pub fn on_mod_settings_settled(&mut self, mods: Vec<Mod>) {
        if self.is_exiting() {
            return;
        }
        if self.client.room().is_none() {
            debug!("room left before mod settings were sent; discarding");
            return;
        }

        self.send_request(RoomRequest::ChangeUserMods(to_api_mods(&mods)));
    }

    /// Local content presence changed.
    pub fn set_beatmap_availability(&mut self, availability: BeatmapAvailability) {
        if self.is_exiting() {
            return;
        }
        if let Some(change) = self.beatmap_availability.set(availability) {
            self.on_availability_changed(change);
        }
    }

    pub fn set_settings_visible(&mut self, visible: bool) {
        if self.is_exiting() {
            return;
        }
        if self.settings_visible.set(visible).is_some() {
            self.reveal_main_content();
        }
    }

    /// Host-only: open song selection for a beatmap picked elsewhere.
    pub fn present_beatmap(&mut self, beatmap: BeatmapPresentation) {
        if self.is_exiting() || !self.has_focus {
            return;
        }
        if !self.client.is_host() {
            debug!("ignoring beatmap presentation; local user is not host");
            return;
        }

        emit_event(&self.event_tx, MatchEvent::SongSelectRequested { beatmap });
    }

    /// Back navigation.
    pub fn on_back_requested(&mut self) {
        if self.is_exiting() {
            return;
        }

        if self.client.room().is_none() {
            self.exit(ExitReason::UserRequested);
            return;
        }

        if *self.settings_visible.value() {
            self.set_settings_visible(false);
            return;
        }

        self.request_exit();
    }

    /// Leave the match, asking for confirmation if the room is live.
    pub fn request_exit(&mut self) {
        if self.is_exiting() {
            return;
        }

        // Leaving a room that no longer exists needs no confirmation.
        if self.client.room().is_none() || !self.connected || self.exit_confirmed {
            self.exit(ExitReason::UserRequested);
            return;
        }

        if self.confirmation_pending {
            self.on_exit_confirmed();
            return;
        }

        self.confirmation_pending = true;
        emit_event(&self.event_tx, MatchEvent::ExitConfirmationRequested);
    }

    pub fn on_exit_confirmed(&mut self) {
        if !self.confirmation_pending {
            debug!("exit confirmation received without a pending prompt");
            return;
        }

        self.confirmation_pending = false;
        self.exit_confirmed = true;
        self.exit(ExitReason::UserRequested);
    }

    pub fn on_exit_declined(&mut self) {
        self.confirmation_pending = false;
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Leave [`Phase::AwaitingRoom`] once the room exists and the settings
    /// overlay is hidden, whichever of the two happens last.
    fn reveal_main_content(&mut self) {
        if self.phase != Phase::AwaitingRoom
            || *self.settings_visible.value()
            || self.client.room().is_none()
        {
            return;
        }

        debug!("room created; revealing main content");
        self.phase = Phase::InRoom;
        emit_event(&self.event_tx, MatchEvent::MainContentShown);
    }

    fn on_availability_changed(&mut self, change: ValueChanged<BeatmapAvailability>) {
        let Some(room) = self.client.room() else {
            return;
        };

        self.send_request(RoomRequest::ChangeBeatmapAvailability(change.new));

        let was_available = change.old.is_locally_available();
        let is_available = change.new.is_locally_available();
        let local_state = self.client.local_user().map(|user| user.state);

        if was_available && !is_available {
            // The user cannot stay ready for content that no longer exists.
            if local_state == Some(MultiplayerUserState::Ready) {
                self.send_request(RoomRequest::ChangeState(MultiplayerUserState::Idle));
            }
        } else if !was_available && is_available {
            let match_in_progress = matches!(
                room.state,
                MultiplayerRoomState::WaitingForLoad | MultiplayerRoomState::Playing
            );
            let joins_as_spectator =
                local_state == Some(MultiplayerUserState::Spectating) && match_in_progress;

            if self.load_deferred || joins_as_spectator {
                self.on_load_requested();
            }
        }
    }

    fn try_start_gameplay(&mut self) {
        if !self.has_focus {
            if !self.awaiting_focus {
                debug!("gameplay load waiting for screen focus");
                self.awaiting_focus = true;
                emit_event(&self.event_tx, MatchEvent::FocusRequested);
            }
            return;
        }

        self.awaiting_focus = false;
        self.phase = Phase::InRoom;

        match self.gameplay_target() {
            Some(target) => {
                // The gameplay screen takes focus.
                self.has_focus = false;
                emit_event(&self.event_tx, MatchEvent::GameplayStarted { target });
            }
            None => warn!("gameplay load requested without room, local user or playlist item"),
        }

        self.release_ready_operation();
    }

    fn gameplay_target(&self) -> Option<GameplayTarget> {
        let room = self.client.room()?;
        let local_user = self.client.local_user()?;
        let users = room.playing_users();

        if local_user.state == MultiplayerUserState::Spectating {
            return Some(GameplayTarget::Spectator {
                users: users
                    .into_iter()
                    .take(self.max_spectated_players)
                    .collect(),
            });
        }

        Some(GameplayTarget::Player {
            item: self.selected_item.value().clone()?,
            users,
        })
    }

    /// Open the ready operation for a click, or explain why the click is
    /// ignored.
    fn begin_ready_operation(&mut self, control: &'static str) -> Option<OperationId> {
        if self.is_exiting() {
            return None;
        }
        if self.client.room().is_none() {
            debug!(control, "click ignored; room not created yet");
            return None;
        }
        if let Some(pending) = &self.ready_operation {
            debug!(control, operation = %pending.id(), "click ignored; operation pending");
            return None;
        }

        match self.tracker.begin() {
            Ok(token) => {
                let id = token.id();
                self.ready_operation = Some(token);
                Some(id)
            }
            Err(e) => {
                debug!(control, "click ignored: {e}");
                None
            }
        }
    }

    fn release_ready_operation(&mut self) {
        if let Some(mut token) = self.ready_operation.take() {
            token.end();
        }
    }

    fn spawn_tracked(&self, operation: OperationId, action: TrackedAction) {
        debug!(%operation, ?action, "starting tracked operation");
        let client = Arc::clone(&self.client);
        let completion_tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let result = match action {
                TrackedAction::StartMatch => client.start_match().await,
                TrackedAction::ToggleReady => client.toggle_ready().await,
                TrackedAction::ToggleSpectate => client.toggle_spectate().await,
            };
            // Nobody is listening once the session has ended.
            let _ = completion_tx.send(Completion {
                operation,
                action,
                result,
            });
        });
    }

    fn send_request(&self, request: RoomRequest) {
        if let Err(mpsc::error::SendError(request)) = self.request_tx.send(request) {
            warn!("room request worker stopped, dropping {request:?}");
        }
    }
}

/// Forward untracked room requests to the server one at a time, so a later
/// value can never overtake an earlier one. Stops once the coordinator is
/// dropped and the queue is drained.
async fn request_worker<C: RoomClient>(
    client: Arc<C>,
    mut requests: mpsc::UnboundedReceiver<RoomRequest>,
) {
    while let Some(request) = requests.recv().await {
        let result = match &request {
            RoomRequest::ChangeUserMods(mods) => client.change_user_mods(mods.clone()).await,
            RoomRequest::ChangeBeatmapAvailability(availability) => {
                client.change_beatmap_availability(*availability).await
            }
            RoomRequest::ChangeState(state) => client.change_state(*state).await,
        };
        if let Err(e) = result {
            warn!("room request {request:?} failed: {e}");
        }
    }
    debug!("room request worker stopped");
}

impl<C: RoomClient> std::fmt::Debug for MatchCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchCoordinator")
            .field("phase", &self.phase)
            .field("pending_operation", &self.has_pending_operation())
            .field("has_focus", &self.has_focus)
            .field("load_deferred", &self.load_deferred)
            .finish()
    }
}

fn to_api_mods(mods: &[Mod]) -> Vec<ApiMod> {
    mods.iter().map(ApiMod::from).collect()
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event rather than stall the session loop.
pub(crate) fn emit_event(event_tx: &mpsc::Sender<MatchEvent>, event: MatchEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::MatchError;
    use crate::protocol::{MultiplayerRoom, MultiplayerRoomUser, UserId};
    use crate::room_client::RoomEvent;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{broadcast, watch};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        UserMods(Vec<ApiMod>),
        Availability(BeatmapAvailability),
        State(MultiplayerUserState),
        StartMatch,
    }

    struct FakeRoom {
        room: StdMutex<Option<MultiplayerRoom>>,
        calls: StdMutex<Vec<Call>>,
        connected: watch::Sender<bool>,
        events: broadcast::Sender<RoomEvent>,
    }

    impl FakeRoom {
        fn new(room: Option<MultiplayerRoom>) -> Arc<Self> {
            let (connected, _) = watch::channel(true);
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                room: StdMutex::new(room),
                calls: StdMutex::new(Vec::new()),
                connected,
                events,
            })
        }

        fn set_room(&self, room: Option<MultiplayerRoom>) {
            *self.room.lock().unwrap() = room;
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &Call) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl RoomClient for FakeRoom {
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
            self.record(Call::UserMods(mods));
            Ok(())
        }

        async fn change_beatmap_availability(
            &self,
            availability: BeatmapAvailability,
        ) -> Result<()> {
            self.record(Call::Availability(availability));
            Ok(())
        }

        async fn change_state(&self, state: MultiplayerUserState) -> Result<()> {
            self.record(Call::State(state));
            Ok(())
        }

        async fn start_match(&self) -> Result<()> {
            self.record(Call::StartMatch);
            Ok(())
        }
    }

    fn local_id() -> UserId {
        Uuid::from_u128(7)
    }

    fn playlist_item() -> PlaylistItem {
        PlaylistItem {
            id: 1,
            beatmap_id: 100,
            ruleset_id: 0,
            required_mods: vec![ApiMod::new("HD")],
            allowed_mods: vec![ApiMod::new("DT"), ApiMod::new("DA")],
        }
    }

    fn room_with(
        state: MultiplayerRoomState,
        local_state: MultiplayerUserState,
        local_is_host: bool,
    ) -> MultiplayerRoom {
        let mut local = MultiplayerRoomUser::new(local_id());
        local.state = local_state;
        MultiplayerRoom {
            room_id: Uuid::from_u128(1),
            name: "room".into(),
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

    fn open_room(local_state: MultiplayerUserState) -> MultiplayerRoom {
        room_with(MultiplayerRoomState::Open, local_state, false)
    }

    /// Let spawned room requests run to completion.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    struct Harness {
        client: Arc<FakeRoom>,
        tracker: OperationTracker,
        coordinator: MatchCoordinator<FakeRoom>,
        events: mpsc::Receiver<MatchEvent>,
        completions: mpsc::UnboundedReceiver<Completion>,
    }

    impl Harness {
        fn new(room: Option<MultiplayerRoom>) -> Self {
            Self::with_config(room, &MatchConfig::new())
        }

        fn with_config(room: Option<MultiplayerRoom>, config: &MatchConfig) -> Self {
            let client = FakeRoom::new(room);
            let tracker = OperationTracker::new();
            let (event_tx, events) = mpsc::channel(64);
            let (coordinator, completions) =
                MatchCoordinator::new(Arc::clone(&client), tracker.clone(), config, event_tx);
            Self {
                client,
                tracker,
                coordinator,
                events,
                completions,
            }
        }

        fn available(room: MultiplayerRoom) -> Self {
            Self::with_config(
                Some(room),
                &MatchConfig::new()
                    .with_initial_availability(BeatmapAvailability::locally_available()),
            )
        }

        fn drain_events(&mut self) -> Vec<MatchEvent> {
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                drained.push(event);
            }
            drained
        }

        fn gameplay_starts(&mut self) -> Vec<GameplayTarget> {
            self.drain_events()
                .into_iter()
                .filter_map(|event| match event {
                    MatchEvent::GameplayStarted { target } => Some(target),
                    _ => None,
                })
                .collect()
        }
    }

    // ── Ready / start / spectate ────────────────────────────────────

    #[tokio::test]
    async fn ready_click_is_submitted_once() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));

        h.coordinator.on_ready_clicked();
        h.coordinator.on_ready_clicked();
        assert!(h.coordinator.has_pending_operation());
        assert!(h.tracker.in_progress());

        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.action, TrackedAction::ToggleReady);
        settle().await;
        assert_eq!(h.client.calls(), [Call::State(MultiplayerUserState::Ready)]);

        h.coordinator.on_operation_completed(completion);
        assert!(!h.coordinator.has_pending_operation());
        assert!(!h.tracker.in_progress());
    }

    #[tokio::test]
    async fn clicks_before_room_creation_do_nothing() {
        let mut h = Harness::new(None);
        assert_eq!(h.coordinator.phase(), Phase::AwaitingRoom);

        h.coordinator.on_ready_clicked();
        h.coordinator.on_spectate_clicked();
        settle().await;

        assert!(!h.coordinator.has_pending_operation());
        assert!(h.client.calls().is_empty());
        assert!(h.completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn click_is_ignored_while_another_operation_is_tracked() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        let _elsewhere = h.tracker.begin().unwrap();

        h.coordinator.on_ready_clicked();
        settle().await;

        assert!(!h.coordinator.has_pending_operation());
        assert!(h.client.calls().is_empty());
        assert!(h.completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn host_start_holds_operation_until_gameplay() {
        let mut h = Harness::available(room_with(
            MultiplayerRoomState::Open,
            MultiplayerUserState::Ready,
            true,
        ));

        h.coordinator.on_ready_clicked();
        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.action, TrackedAction::StartMatch);
        h.coordinator.on_operation_completed(completion);
        assert!(h.coordinator.has_pending_operation());

        h.client.set_room(Some(room_with(
            MultiplayerRoomState::WaitingForLoad,
            MultiplayerUserState::WaitingForLoad,
            true,
        )));
        h.coordinator.on_room_updated();
        h.coordinator.on_load_requested();

        assert_eq!(h.gameplay_starts().len(), 1);
        assert!(!h.coordinator.has_pending_operation());
        assert!(!h.tracker.in_progress());
        assert_eq!(h.client.count(&Call::StartMatch), 1);
    }

    #[tokio::test]
    async fn failed_start_releases_operation() {
        let mut h = Harness::new(Some(room_with(
            MultiplayerRoomState::Open,
            MultiplayerUserState::Spectating,
            true,
        )));

        h.coordinator.on_ready_clicked();
        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.action, TrackedAction::StartMatch);

        h.coordinator.on_operation_completed(Completion {
            result: Err(MatchError::ServerError {
                message: "no users ready".into(),
                error_code: Some(crate::ErrorCode::NoUsersReady),
            }),
            ..completion
        });

        assert!(!h.coordinator.has_pending_operation());
        assert!(!h.tracker.in_progress());
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.on_spectate_clicked();
        let completion = h.completions.recv().await.unwrap();

        h.coordinator.on_operation_completed(Completion {
            operation: Uuid::new_v4(),
            action: TrackedAction::ToggleSpectate,
            result: Ok(()),
        });
        assert!(h.coordinator.has_pending_operation());

        h.coordinator.on_operation_completed(completion);
        assert!(!h.coordinator.has_pending_operation());
    }

    #[tokio::test]
    async fn dispose_releases_pending_operation() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.on_ready_clicked();
        assert!(h.tracker.in_progress());

        h.coordinator.exit(ExitReason::Shutdown);
        h.coordinator.dispose();
        h.coordinator.dispose();

        assert_eq!(h.coordinator.phase(), Phase::Disposed);
        assert!(!h.tracker.in_progress());
    }

    // ── Availability and gameplay load ──────────────────────────────

    #[tokio::test]
    async fn losing_content_unreadies_once() {
        let mut h = Harness::available(open_room(MultiplayerUserState::Ready));

        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::not_downloaded());
        settle().await;
        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::downloading(0.4));
        settle().await;

        assert_eq!(h.client.count(&Call::State(MultiplayerUserState::Idle)), 1);
        assert_eq!(
            h.client.count(&Call::Availability(BeatmapAvailability::downloading(0.4))),
            1
        );
    }

    #[tokio::test]
    async fn unchanged_availability_is_not_reported() {
        let mut h = Harness::available(open_room(MultiplayerUserState::Idle));
        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::locally_available());
        settle().await;
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn deferred_load_runs_once_content_arrives() {
        let mut h = Harness::new(Some(room_with(
            MultiplayerRoomState::WaitingForLoad,
            MultiplayerUserState::WaitingForLoad,
            false,
        )));

        h.coordinator.on_load_requested();
        assert!(h.gameplay_starts().is_empty());

        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::importing());
        assert!(h.gameplay_starts().is_empty());

        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::locally_available());
        let started = h.gameplay_starts();
        assert_eq!(started.len(), 1);
        assert!(matches!(
            &started[0],
            GameplayTarget::Player { item, users } if item.id == 1 && users.len() == 1
        ));

        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::locally_available());
        assert!(h.gameplay_starts().is_empty());
    }

    #[tokio::test]
    async fn deferred_load_is_dropped_when_room_reopens() {
        let mut h = Harness::new(Some(room_with(
            MultiplayerRoomState::WaitingForLoad,
            MultiplayerUserState::WaitingForLoad,
            false,
        )));
        h.coordinator.on_load_requested();

        h.client.set_room(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.on_room_updated();
        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::locally_available());

        assert!(h.gameplay_starts().is_empty());
    }

    #[tokio::test]
    async fn unfocused_load_waits_for_focus() {
        let mut h = Harness::available(room_with(
            MultiplayerRoomState::WaitingForLoad,
            MultiplayerUserState::WaitingForLoad,
            false,
        ));
        h.coordinator.on_focus_changed(false);

        h.coordinator.on_load_requested();
        h.coordinator.on_load_requested();
        let events = h.drain_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == MatchEvent::FocusRequested)
                .count(),
            1
        );
        assert!(!events
            .iter()
            .any(|e| matches!(e, MatchEvent::GameplayStarted { .. })));
        assert_eq!(h.coordinator.phase(), Phase::AwaitingGameplayLoad);

        h.coordinator.on_focus_changed(true);
        assert_eq!(h.gameplay_starts().len(), 1);
        assert_eq!(h.coordinator.phase(), Phase::InRoom);
        assert!(!h.coordinator.has_focus());
    }

    #[tokio::test]
    async fn spectator_joins_match_in_progress_when_content_arrives() {
        let mut room = room_with(
            MultiplayerRoomState::Playing,
            MultiplayerUserState::Spectating,
            false,
        );
        for id in 10..14 {
            let mut player = MultiplayerRoomUser::new(Uuid::from_u128(id));
            player.state = MultiplayerUserState::Playing;
            room.users.push(player);
        }
        let mut h = Harness::with_config(
            Some(room),
            &MatchConfig::new().with_max_spectated_players(2),
        );

        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::locally_available());

        let started = h.gameplay_starts();
        assert_eq!(started.len(), 1);
        match &started[0] {
            GameplayTarget::Spectator { users } => {
                assert_eq!(users.len(), 2);
                assert_eq!(users[0].user_id, Uuid::from_u128(10));
            }
            other => panic!("expected spectator target, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn losing_content_without_ready_keeps_state() {
        for local_state in [MultiplayerUserState::Idle, MultiplayerUserState::Spectating] {
            let mut h = Harness::available(open_room(local_state));

            h.coordinator
                .set_beatmap_availability(BeatmapAvailability::not_downloaded());
            settle().await;

            assert!(
                !h.client.calls().iter().any(|c| matches!(c, Call::State(_))),
                "no state change expected for {local_state:?}"
            );
            assert_eq!(
                h.client.count(&Call::Availability(BeatmapAvailability::not_downloaded())),
                1
            );
        }
    }

    #[tokio::test]
    async fn ready_user_between_unavailable_states_keeps_state() {
        let mut h = Harness::with_config(
            Some(open_room(MultiplayerUserState::Ready)),
            &MatchConfig::new().with_initial_availability(BeatmapAvailability::downloading(0.2)),
        );

        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::not_downloaded());
        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::importing());
        settle().await;

        assert!(!h.client.calls().iter().any(|c| matches!(c, Call::State(_))));
        assert_eq!(h.client.calls().len(), 2);
    }

    #[tokio::test]
    async fn requests_reach_the_server_in_order() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.enter();

        let mut expected = vec![Call::Availability(BeatmapAvailability::unknown())];
        for step in 1..=10u8 {
            let availability = BeatmapAvailability::downloading(f32::from(step) / 11.0);
            h.coordinator.set_beatmap_availability(availability);
            expected.push(Call::Availability(availability));
        }
        h.coordinator.set_user_mods(vec![Mod::new("DT")]);
        expected.push(Call::UserMods(vec![ApiMod::new("DT")]));
        h.coordinator
            .set_beatmap_availability(BeatmapAvailability::locally_available());
        expected.push(Call::Availability(BeatmapAvailability::locally_available()));
        settle().await;

        assert_eq!(h.client.calls(), expected);
    }

    // ── Mods ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn effective_mods_combine_server_and_required_mods() {
        let mut room = open_room(MultiplayerUserState::Idle);
        room.users[0].mods = vec![ApiMod::new("DT")];
        let mut h = Harness::new(Some(room));

        h.coordinator.enter();

        assert_eq!(h.coordinator.mods(), [Mod::new("DT"), Mod::new("HD")]);
        assert!(h.drain_events().contains(&MatchEvent::ModsChanged {
            mods: vec![Mod::new("DT"), Mod::new("HD")],
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn setting_edits_are_sent_once_settled() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.set_user_mods(vec![Mod::new("DA")]);

        for ar in [5, 6, 7, 8] {
            h.coordinator
                .change_mod_setting("DA", "approach_rate", serde_json::json!(ar));
        }
        let settled = h.coordinator.mod_settings_settled().await;
        h.coordinator.on_mod_settings_settled(settled);
        settle().await;

        assert_eq!(
            h.client.calls(),
            [
                Call::UserMods(vec![ApiMod::new("DA")]),
                Call::UserMods(vec![
                    ApiMod::new("DA").with_setting("approach_rate", serde_json::json!(8))
                ]),
            ]
        );
    }

    #[tokio::test]
    async fn setting_edits_before_room_creation_are_not_tracked() {
        let mut h = Harness::new(None);
        h.coordinator.set_user_mods(vec![Mod::new("DA")]);
        h.coordinator
            .change_mod_setting("DA", "approach_rate", serde_json::json!(9));
        settle().await;

        assert!(h.client.calls().is_empty());
        assert!(h.coordinator.user_mods()[0].settings.is_empty());
    }

    // ── Navigation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn room_arriving_after_settings_hidden_reveals_main_content() {
        let mut h = Harness::new(None);
        h.coordinator.enter();
        h.coordinator.set_settings_visible(false);
        assert_eq!(h.coordinator.phase(), Phase::AwaitingRoom);
        assert!(!h.drain_events().contains(&MatchEvent::MainContentShown));

        h.client.set_room(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.on_room_updated();

        assert_eq!(h.coordinator.phase(), Phase::InRoom);
        let events = h.drain_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == MatchEvent::MainContentShown)
                .count(),
            1
        );

        h.coordinator.on_room_updated();
        assert!(!h.drain_events().contains(&MatchEvent::MainContentShown));
    }


    #[tokio::test]
    async fn back_hides_settings_before_asking_to_leave() {
        let mut h = Harness::new(None);
        h.coordinator.enter();
        assert!(h.coordinator.settings_visible());

        h.client.set_room(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.on_room_updated();
        h.drain_events();

        h.coordinator.on_back_requested();
        assert!(!h.coordinator.is_exiting());
        assert_eq!(h.coordinator.phase(), Phase::InRoom);
        assert_eq!(
            h.drain_events(),
            [
                MatchEvent::SettingsVisibilityChanged { visible: false },
                MatchEvent::MainContentShown,
            ]
        );

        h.coordinator.on_back_requested();
        assert_eq!(h.drain_events(), [MatchEvent::ExitConfirmationRequested]);
        assert!(!h.coordinator.is_exiting());

        // Backing out again while the prompt is open confirms it.
        h.coordinator.on_back_requested();
        assert!(h.coordinator.is_exiting());
        assert_eq!(h.coordinator.exit_reason(), Some(ExitReason::UserRequested));
    }

    #[tokio::test]
    async fn back_before_creation_leaves_without_prompt() {
        let mut h = Harness::new(None);
        h.coordinator.on_back_requested();

        assert!(h.coordinator.is_exiting());
        assert!(!h
            .drain_events()
            .contains(&MatchEvent::ExitConfirmationRequested));
    }

    #[tokio::test]
    async fn declined_exit_prompts_again() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.request_exit();
        h.coordinator.on_exit_declined();
        h.coordinator.request_exit();

        assert!(!h.coordinator.is_exiting());
        assert_eq!(
            h.drain_events(),
            [
                MatchEvent::ExitConfirmationRequested,
                MatchEvent::ExitConfirmationRequested,
            ]
        );

        h.coordinator.on_exit_confirmed();
        assert!(h.coordinator.is_exiting());
    }

    #[tokio::test]
    async fn first_exit_reason_wins() {
        let mut h = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        h.coordinator.on_connection_changed(false);
        h.coordinator.on_current_room_lost();
        h.coordinator.request_exit();

        assert_eq!(h.coordinator.exit_reason(), Some(ExitReason::Disconnected));
        assert!(!h
            .drain_events()
            .contains(&MatchEvent::ExitConfirmationRequested));
    }

    #[tokio::test]
    async fn present_beatmap_requires_host_and_focus() {
        let beatmap = BeatmapPresentation {
            beatmap_id: 5,
            ruleset_id: 1,
        };

        let mut guest = Harness::new(Some(open_room(MultiplayerUserState::Idle)));
        guest.coordinator.present_beatmap(beatmap);
        assert!(guest.drain_events().is_empty());

        let mut host = Harness::new(Some(room_with(
            MultiplayerRoomState::Open,
            MultiplayerUserState::Idle,
            true,
        )));
        host.coordinator.on_focus_changed(false);
        host.coordinator.present_beatmap(beatmap);
        assert!(host.drain_events().is_empty());

        host.coordinator.on_focus_changed(true);
        host.coordinator.present_beatmap(beatmap);
        assert_eq!(
            host.drain_events(),
            [MatchEvent::SongSelectRequested { beatmap }]
        );
    }
}
