//! Session facade and role authority
//!
//! Ties the stores, the reconciliation engine, and the connection manager
//! together behind one API. All state mutations - local actions, inbound
//! protocol events, and timer ticks - are serialized through a single lock,
//! so a resync tick can never observe a half-applied merge.
//!
//! Role gating is centralized here: every host-only operation passes through
//! [`authorized`]. Listener-issued attempts are silent no-ops, not errors;
//! the UI is expected to hide these controls, the state layer stays
//! defensive regardless of caller.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::now_ms;
use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
};
use crate::library::{LibraryClient, LibraryError};
use crate::playback::{PlaybackAction, PlaybackState, PlaybackStore};
use crate::playlist::{PlaylistState, Track};
use crate::reconcile::{Correction, SyncConfig};
use crate::storage::PreferencesProvider;
use crate::sync::{Membership, Role, SessionId, SessionState, WireEvent};

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not in a session")]
    NotInSession,

    #[error("already in a session")]
    AlreadyInSession,

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("connection error: {0}")]
    Connection(#[from] crate::connection::ConnectionError),

    #[error("library error: {0}")]
    Library(#[from] LibraryError),

    #[error("track rejected: {0}")]
    TrackRejected(String),
}

/// Events surfaced to the embedder
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// We entered a session (create or join confirmed)
    Joined { session_id: String, role: Role },
    /// We left the session
    Left { reason: Option<String> },
    ParticipantCountChanged(u32),
    /// Playback state moved; the embedder should mirror it to its player
    PlaybackChanged(PlaybackState),
    /// Playlist replica moved
    PlaylistChanged(Vec<Track>),
    /// The reconciliation engine wants the local player corrected
    CorrectionRequired(Correction),
    ConnectionChanged(ConnectionState),
    /// Non-fatal error worth showing to the user
    Error(String),
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sync: SyncConfig,
    pub connection: ConnectionConfig,
    /// Interval between host anchor snapshots
    pub heartbeat_interval: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            connection: ConnectionConfig::default(),
            heartbeat_interval: std::time::Duration::from_millis(1500),
        }
    }
}

/// State behind the single serialization lock
struct SessionCore {
    membership: Membership,
    playback: PlaybackStore,
    playlist: PlaylistState,
}

/// Shared internals used by the facade and the background loops
struct Shared {
    core: RwLock<SessionCore>,
    config: SessionConfig,
    prefs: Arc<dyn PreferencesProvider>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    resync_cancel: RwLock<Option<oneshot::Sender<()>>>,
    heartbeat_cancel: RwLock<Option<oneshot::Sender<()>>>,
}

/// Main session interface
pub struct Session {
    shared: Arc<Shared>,
    connection: ConnectionHandle,
}

impl Session {
    /// Create a session facade. Returns the facade and the stream of
    /// [`SessionEvent`]s the embedder should drive its UI/player from.
    pub fn new(
        prefs: Arc<dyn PreferencesProvider>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let (connection, connection_events) =
            ConnectionManager::with_config(config.connection.clone()).start();

        let shared = Arc::new(Shared {
            core: RwLock::new(SessionCore {
                membership: Membership::None,
                playback: PlaybackStore::new(Arc::clone(&prefs)),
                playlist: PlaylistState::new(),
            }),
            config,
            prefs,
            event_tx,
            resync_cancel: RwLock::new(None),
            heartbeat_cancel: RwLock::new(None),
        });

        spawn_connection_loop(Arc::clone(&shared), connection.clone(), connection_events);

        (
            Self {
                shared,
                connection,
            },
            event_rx,
        )
    }

    // === Connection ===

    /// Connect to a relay URL (ws:// or wss://)
    pub fn connect(&self, url: &str) -> Result<(), SessionError> {
        self.connection.connect(url)?;
        Ok(())
    }

    /// Disconnect, cancelling any pending reconnect
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.connection.disconnect()?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    // === Session membership ===

    /// Ask the relay to create a session; we become host when it confirms
    pub fn create_session(&self) -> Result<(), SessionError> {
        {
            let mut core = self.shared.core.write();
            if core.membership.is_busy() {
                return Err(SessionError::AlreadyInSession);
            }
            core.membership = Membership::Creating;
        }
        self.connection.send(WireEvent::SessionCreate)?;
        Ok(())
    }

    /// Join an existing session as listener
    pub fn join_session(&self, session_id: &str) -> Result<(), SessionError> {
        let id = SessionId::parse(session_id)
            .ok_or_else(|| SessionError::InvalidSessionId(session_id.to_string()))?;

        {
            let mut core = self.shared.core.write();
            if core.membership.is_busy() {
                return Err(SessionError::AlreadyInSession);
            }
            core.membership = Membership::Joining {
                session_id: id.as_str().to_string(),
            };
        }
        self.connection.send(WireEvent::SessionJoin {
            session_id: id.as_str().to_string(),
        })?;
        Ok(())
    }

    /// Leave the current session; playback returns to defaults
    pub fn leave_session(&self) -> Result<(), SessionError> {
        {
            let core = self.shared.core.read();
            if !core.membership.is_busy() {
                return Err(SessionError::NotInSession);
            }
        }

        stop_loop(&self.shared.resync_cancel);
        stop_loop(&self.shared.heartbeat_cancel);

        // Best effort: the relay also notices the socket going quiet
        let _ = self.connection.send(WireEvent::SessionLeave);

        {
            let mut core = self.shared.core.write();
            core.membership = Membership::None;
            core.playback.reset();
            core.playlist = PlaylistState::new();
        }

        self.shared.emit(SessionEvent::Left { reason: None });
        info!("Left session");
        Ok(())
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.shared.core.read().membership.state().cloned()
    }

    /// Check if we are the host
    pub fn is_host(&self) -> bool {
        self.shared.core.read().membership.state().map(SessionState::is_host).unwrap_or(false)
    }

    // === Playback (host-gated where authoritative) ===

    /// Start playback (host only; listener calls are no-ops)
    pub fn play(&self) -> Result<(), SessionError> {
        self.host_command(|ts| (PlaybackAction::Play { timestamp_ms: ts }, WireEvent::Play { timestamp_ms: ts }))
    }

    /// Pause playback (host only; listener calls are no-ops)
    pub fn pause(&self) -> Result<(), SessionError> {
        self.host_command(|ts| (PlaybackAction::Pause { timestamp_ms: ts }, WireEvent::Pause { timestamp_ms: ts }))
    }

    /// Seek to a position (host only; listener calls are no-ops)
    pub fn seek(&self, position_seconds: f64) -> Result<(), SessionError> {
        self.host_command(|ts| {
            (
                PlaybackAction::Seek {
                    position_seconds,
                    timestamp_ms: ts,
                },
                WireEvent::Seek {
                    position_seconds,
                    timestamp_ms: ts,
                },
            )
        })
    }

    /// Select a playlist track (host only): updates the selection, loads the
    /// track into the playback store, and broadcasts a fresh anchor.
    pub fn select_track(&self, index: usize) -> Result<(), SessionError> {
        let timestamp_ms = now_ms();

        let broadcast = {
            let mut core = self.shared.core.write();
            if !authorized(&core) {
                debug!("select_track ignored: not host");
                return Ok(());
            }
            let Some(track) = core.playlist.track_at(index).cloned() else {
                return Err(SessionError::TrackRejected(format!(
                    "no track at index {}",
                    index
                )));
            };
            core.playlist.set_current_index(index);

            core.playback.dispatch(PlaybackAction::SetTrack {
                track_id: track.id.clone(),
                track_url: track.url.clone(),
                track_title: track.title.clone(),
                track_artist: track.artist.clone(),
            });
            if let Some(error) = core.playback.state().last_error.clone() {
                return Err(SessionError::TrackRejected(error));
            }
            // Anchor the new track at zero so listeners reconcile from here
            core.playback.dispatch(PlaybackAction::Seek {
                position_seconds: 0.0,
                timestamp_ms,
            });

            self.shared
                .emit(SessionEvent::PlaybackChanged(core.playback.state().clone()));

            WireEvent::TrackChange {
                track_id: track.id,
                track_url: track.url,
                track_title: track.title,
                track_artist: track.artist,
                timestamp_ms,
            }
        };

        self.send_or_report(broadcast);
        Ok(())
    }

    /// Report local player progress. Not host-gated: every participant's
    /// player advances and reconciliation compares against this value.
    pub fn update_progress(&self, position_seconds: f64) {
        let mut core = self.shared.core.write();
        core.playback.dispatch(PlaybackAction::UpdateProgress { position_seconds });
    }

    // === Volume (locally owned, never gated, never broadcast) ===

    pub fn set_volume(&self, volume: u8) {
        let state = {
            let mut core = self.shared.core.write();
            core.playback
                .dispatch(PlaybackAction::SetVolume { volume })
                .clone()
        };
        self.shared.emit(SessionEvent::PlaybackChanged(state));
    }

    pub fn toggle_mute(&self) {
        let state = {
            let mut core = self.shared.core.write();
            core.playback.dispatch(PlaybackAction::ToggleMute).clone()
        };
        self.shared.emit(SessionEvent::PlaybackChanged(state));
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.shared.core.read().playback.state().clone()
    }

    /// Playback buffer (seconds of audio) the embedder should hold for the
    /// currently measured latency.
    pub fn recommended_buffer_secs(&self) -> f64 {
        let latency_ms = self.connection.state().latency_ms;
        crate::reconcile::buffer_size(latency_ms, self.shared.config.sync.base_buffer_secs)
    }

    // === Playlist (host-gated) ===

    /// Append a track (host only; listener calls are no-ops). Returns the
    /// rejection when the id already exists.
    pub fn add_track(&self, track: Track) -> Result<(), SessionError> {
        let broadcast = {
            let mut core = self.shared.core.write();
            if !authorized(&core) {
                debug!("add_track ignored: not host");
                return Ok(());
            }
            if !core.playlist.add_track(track) {
                return Err(SessionError::TrackRejected(
                    "duplicate track id".to_string(),
                ));
            }
            self.shared
                .emit(SessionEvent::PlaylistChanged(core.playlist.tracks().to_vec()));
            WireEvent::PlaylistUpdate {
                tracks: core.playlist.to_wire(),
            }
        };
        self.send_or_report(broadcast);
        Ok(())
    }

    /// Fetch a track from the library and append it (host only).
    /// An expired token clears stored credentials per the auth contract.
    pub async fn add_library_track(
        &self,
        library: &LibraryClient,
        track_id: &str,
    ) -> Result<(), SessionError> {
        {
            let core = self.shared.core.read();
            if !authorized(&core) {
                debug!("add_library_track ignored: not host");
                return Ok(());
            }
        }

        let metadata = match library.track(track_id).await {
            Ok(metadata) => metadata,
            Err(LibraryError::Unauthorized) => {
                warn!("Library token expired; clearing stored credentials");
                self.shared.prefs.clear_credentials();
                self.shared.emit(SessionEvent::Error(
                    "authorization expired - sign in again".to_string(),
                ));
                return Err(LibraryError::Unauthorized.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.add_track(Track {
            id: metadata.id,
            url: metadata.url,
            title: metadata.title,
            artist: metadata.artist,
            duration_seconds: metadata.duration_seconds,
            added_at_ms: now_ms(),
        })
    }

    /// Remove a track by id (host only; listener calls are no-ops)
    pub fn remove_track(&self, track_id: &str) -> Result<(), SessionError> {
        let broadcast = {
            let mut core = self.shared.core.write();
            if !authorized(&core) {
                debug!("remove_track ignored: not host");
                return Ok(());
            }
            if core.playlist.remove_track(track_id).is_none() {
                return Ok(());
            }
            self.shared
                .emit(SessionEvent::PlaylistChanged(core.playlist.tracks().to_vec()));
            WireEvent::PlaylistUpdate {
                tracks: core.playlist.to_wire(),
            }
        };
        self.send_or_report(broadcast);
        Ok(())
    }

    pub fn playlist(&self) -> Vec<Track> {
        self.shared.core.read().playlist.tracks().to_vec()
    }

    // === Internals ===

    /// A host-gated playback command: one store action plus its broadcast
    fn host_command(
        &self,
        build: impl FnOnce(i64) -> (PlaybackAction, WireEvent),
    ) -> Result<(), SessionError> {
        let (action, broadcast) = build(now_ms());

        {
            let mut core = self.shared.core.write();
            if !authorized(&core) {
                debug!("{} ignored: not host", broadcast.name());
                return Ok(());
            }
            core.playback.dispatch(action);
            self.shared
                .emit(SessionEvent::PlaybackChanged(core.playback.state().clone()));
        }

        self.send_or_report(broadcast);
        Ok(())
    }

    /// Push an event to the relay; offline sends degrade to a reported error
    fn send_or_report(&self, event: WireEvent) {
        if let Err(e) = self.connection.send(event) {
            self.shared
                .emit(SessionEvent::Error(format!("broadcast failed: {}", e)));
        }
    }

    #[cfg(test)]
    fn force_membership(&self, membership: Membership) {
        self.shared.core.write().membership = membership;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        stop_loop(&self.shared.resync_cancel);
        stop_loop(&self.shared.heartbeat_cancel);
        self.connection.shutdown();
    }
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// One reconciliation tick (listeners only): read the store and the
    /// measured latency, correct when drift exceeds the threshold.
    fn resync_tick(&self, connection: &ConnectionHandle) {
        let mut core = self.core.write();

        let is_listener = core
            .membership
            .state()
            .map(|s| !s.is_host())
            .unwrap_or(false);
        if !is_listener {
            return;
        }

        let state = core.playback.state();
        if !state.is_playing {
            return;
        }

        let latency_ms = connection.state().latency_ms;
        let correction = self.config.sync.correction(
            state.position_seconds,
            state.anchor_position_seconds,
            state.server_timestamp_ms,
            now_ms(),
            latency_ms,
        );

        if let Some(correction) = correction {
            debug!(
                "Drift {}ms beyond threshold, correcting to {:.3}s",
                correction.offset_ms as i64, correction.target_position
            );
            core.playback.dispatch(PlaybackAction::ApplyCorrection {
                position_seconds: correction.target_position,
            });
            self.emit(SessionEvent::CorrectionRequired(correction));
        }
    }

    /// One host heartbeat: broadcast the current anchor snapshot
    fn heartbeat_tick(&self, connection: &ConnectionHandle) {
        let snapshot = {
            let core = self.core.read();
            if !authorized(&core) {
                return;
            }
            core.playback.state().host_snapshot(now_ms())
        };
        let _ = connection.send(WireEvent::Snapshot(snapshot));
    }

    /// Apply an inbound protocol event to the stores
    fn apply_wire_event(self: &Arc<Self>, connection: &ConnectionHandle, event: WireEvent) {
        match event {
            WireEvent::SessionJoined {
                session_id,
                role,
                participant_count,
            } => {
                {
                    let mut core = self.core.write();
                    core.membership = Membership::Active(SessionState::new(
                        session_id.clone(),
                        role,
                        participant_count,
                    ));
                }
                info!("Session {} joined as {:?}", session_id, role);
                self.emit(SessionEvent::Joined { session_id, role });
            }

            WireEvent::SessionParticipants { participant_count } => {
                let mut core = self.core.write();
                if let Some(state) = core.membership.state_mut() {
                    state.participant_count = participant_count;
                    self.emit(SessionEvent::ParticipantCountChanged(participant_count));
                }
            }

            WireEvent::TrackChange {
                track_id,
                track_url,
                track_title,
                track_artist,
                timestamp_ms,
            } => {
                let mut core = self.core.write();
                if authorized(&core) {
                    return; // we are the authority; ignore echoes
                }
                core.playback.dispatch(PlaybackAction::SetTrack {
                    track_id,
                    track_url,
                    track_title,
                    track_artist,
                });
                if let Some(error) = core.playback.state().last_error.clone() {
                    self.emit(SessionEvent::Error(error));
                    return;
                }
                core.playback.dispatch(PlaybackAction::Seek {
                    position_seconds: 0.0,
                    timestamp_ms,
                });
                self.emit(SessionEvent::PlaybackChanged(core.playback.state().clone()));
            }

            WireEvent::Play { timestamp_ms } => {
                self.apply_listener_action(PlaybackAction::Play { timestamp_ms });
            }

            WireEvent::Pause { timestamp_ms } => {
                self.apply_listener_action(PlaybackAction::Pause { timestamp_ms });
            }

            WireEvent::Seek {
                position_seconds,
                timestamp_ms,
            } => {
                self.apply_listener_action(PlaybackAction::Seek {
                    position_seconds,
                    timestamp_ms,
                });
            }

            WireEvent::Snapshot(snapshot) => {
                self.apply_listener_action(PlaybackAction::ApplyRemoteSnapshot(snapshot));
            }

            WireEvent::PlaylistUpdate { tracks } => {
                let mut core = self.core.write();
                if authorized(&core) {
                    return;
                }
                core.playlist.apply_update(tracks);
                self.emit(SessionEvent::PlaylistChanged(core.playlist.tracks().to_vec()));
            }

            WireEvent::Error { message } => {
                warn!("Relay error: {}", message);
                self.emit(SessionEvent::Error(message));
            }

            // Probe traffic is handled inside the connection manager;
            // client->relay requests are not addressed to us.
            WireEvent::Ping { .. }
            | WireEvent::Pong { .. }
            | WireEvent::SessionCreate
            | WireEvent::SessionJoin { .. }
            | WireEvent::SessionLeave => {}
        }

        // Role may have just been established: make sure the right periodic
        // loop is running.
        self.sync_loops(connection);
    }

    /// Remote playback mutations apply to listener replicas only
    fn apply_listener_action(&self, action: PlaybackAction) {
        let mut core = self.core.write();
        if authorized(&core) {
            return;
        }
        core.playback.dispatch(action);
        self.emit(SessionEvent::PlaybackChanged(core.playback.state().clone()));
    }

    /// Start/stop the periodic loops to match the current role
    fn sync_loops(self: &Arc<Self>, connection: &ConnectionHandle) {
        let role = self
            .core
            .read()
            .membership
            .state()
            .map(|s| s.role);

        match role {
            Some(Role::Listener) => {
                if self.resync_cancel.read().is_none() {
                    start_resync_loop(Arc::clone(self), connection.clone());
                }
                stop_loop(&self.heartbeat_cancel);
            }
            Some(Role::Host) => {
                if self.heartbeat_cancel.read().is_none() {
                    start_heartbeat_loop(Arc::clone(self), connection.clone());
                }
                stop_loop(&self.resync_cancel);
            }
            None => {
                stop_loop(&self.resync_cancel);
                stop_loop(&self.heartbeat_cancel);
            }
        }
    }
}

/// The single authorization gate for host-only mutations
fn authorized(core: &SessionCore) -> bool {
    core.membership
        .state()
        .map(SessionState::is_host)
        .unwrap_or(false)
}

fn stop_loop(cancel: &RwLock<Option<oneshot::Sender<()>>>) {
    if let Some(tx) = cancel.write().take() {
        let _ = tx.send(());
    }
}

/// Drain connection events into the session
fn spawn_connection_loop(
    shared: Arc<Shared>,
    connection: ConnectionHandle,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => {
                    shared.emit(SessionEvent::ConnectionChanged(connection.state()));

                    // Rejoin after a reconnect so sync resumes seamlessly
                    let rejoin = shared
                        .core
                        .read()
                        .membership
                        .state()
                        .map(|s| s.session_id.clone());
                    if let Some(session_id) = rejoin {
                        info!("Reconnected; rejoining session {}", session_id);
                        let _ = connection.send(WireEvent::SessionJoin { session_id });
                    }
                }
                ConnectionEvent::Disconnected { error } => {
                    shared.emit(SessionEvent::ConnectionChanged(connection.state()));
                    if let Some(error) = error {
                        shared.emit(SessionEvent::Error(error));
                    }
                }
                ConnectionEvent::Reconnecting { .. } | ConnectionEvent::LatencyUpdated { .. } => {
                    shared.emit(SessionEvent::ConnectionChanged(connection.state()));
                }
                ConnectionEvent::Inbound(event) => {
                    shared.apply_wire_event(&connection, event);
                }
                ConnectionEvent::Error(message) => {
                    shared.emit(SessionEvent::Error(message));
                }
            }
        }
        debug!("Connection event loop ended");
    });
}

/// Periodic reconciliation (listener side)
fn start_resync_loop(shared: Arc<Shared>, connection: ConnectionHandle) {
    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    *shared.resync_cancel.write() = Some(cancel_tx);

    let interval = shared.config.sync.resync_interval;
    tokio::spawn(async move {
        debug!("Resync loop started ({:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("Resync loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    shared.resync_tick(&connection);
                }
            }
        }
    });
}

/// Periodic anchor broadcast (host side)
fn start_heartbeat_loop(shared: Arc<Shared>, connection: ConnectionHandle) {
    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    *shared.heartbeat_cancel.write() = Some(cancel_tx);

    let interval = shared.config.heartbeat_interval;
    tokio::spawn(async move {
        debug!("Heartbeat loop started ({:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("Heartbeat loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    shared.heartbeat_tick(&connection);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPreferences;
    use crate::sync::PlaybackSnapshot;

    fn listener_session() -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session, events) = Session::new(
            Arc::new(MemoryPreferences::new()),
            SessionConfig::default(),
        );
        session.force_membership(Membership::Active(SessionState::new(
            "ABCDEFGH".to_string(),
            Role::Listener,
            2,
        )));
        (session, events)
    }

    fn host_session() -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session, events) = Session::new(
            Arc::new(MemoryPreferences::new()),
            SessionConfig::default(),
        );
        session.force_membership(Membership::Active(SessionState::new(
            "ABCDEFGH".to_string(),
            Role::Host,
            1,
        )));
        (session, events)
    }

    #[tokio::test]
    async fn test_listener_playback_commands_are_noops() {
        let (session, _events) = listener_session();

        session.play().unwrap();
        assert!(!session.playback_state().is_playing);

        session.seek(42.0).unwrap();
        assert_eq!(session.playback_state().position_seconds, 0.0);

        session
            .add_track(Track {
                id: "t1".to_string(),
                url: "https://x/a.mp3".to_string(),
                title: None,
                artist: None,
                duration_seconds: None,
                added_at_ms: 0,
            })
            .unwrap();
        assert!(session.playlist().is_empty());
    }

    #[tokio::test]
    async fn test_host_mutations_apply_locally() {
        let (session, _events) = host_session();

        session
            .add_track(Track {
                id: "t1".to_string(),
                url: "https://x/a.mp3".to_string(),
                title: Some("One".to_string()),
                artist: None,
                duration_seconds: Some(200.0),
                added_at_ms: 1,
            })
            .unwrap();
        assert_eq!(session.playlist().len(), 1);

        session.select_track(0).unwrap();
        let state = session.playback_state();
        assert_eq!(state.track_id, "t1");
        assert_eq!(state.position_seconds, 0.0);

        session.play().unwrap();
        assert!(session.playback_state().is_playing);
    }

    #[tokio::test]
    async fn test_volume_is_never_gated() {
        let (session, _events) = listener_session();

        session.set_volume(40);
        session.toggle_mute();

        let state = session.playback_state();
        assert_eq!(state.volume, 0);
        assert!(state.is_muted);
        assert_eq!(state.previous_volume, 40);
    }

    #[tokio::test]
    async fn test_remote_events_update_listener_replica() {
        let (session, _events) = listener_session();
        let connection = session.connection.clone();

        session.shared.apply_wire_event(
            &connection,
            WireEvent::TrackChange {
                track_id: "t7".to_string(),
                track_url: "https://x/b.ogg".to_string(),
                track_title: None,
                track_artist: None,
                timestamp_ms: 1_000,
            },
        );
        session
            .shared
            .apply_wire_event(&connection, WireEvent::Play { timestamp_ms: 1_000 });

        let state = session.playback_state();
        assert_eq!(state.track_id, "t7");
        assert!(state.is_playing);
        assert_eq!(state.server_timestamp_ms, 1_000);

        session.shared.apply_wire_event(
            &connection,
            WireEvent::PlaylistUpdate {
                tracks: vec![crate::sync::WireTrack {
                    id: "t7".to_string(),
                    url: "https://x/b.ogg".to_string(),
                    title: None,
                    artist: None,
                    duration_seconds: None,
                }],
            },
        );
        assert_eq!(session.playlist().len(), 1);
    }

    #[tokio::test]
    async fn test_host_ignores_inbound_playback_events() {
        let (session, _events) = host_session();
        let connection = session.connection.clone();

        session
            .shared
            .apply_wire_event(&connection, WireEvent::Pause { timestamp_ms: 99 });
        assert_eq!(session.playback_state().server_timestamp_ms, 0);
    }

    #[tokio::test]
    async fn test_resync_tick_corrects_drift() {
        let (session, mut events) = listener_session();
        let connection = session.connection.clone();

        // Anchor ~5 seconds in the past, player never advanced
        let anchor_ms = now_ms() - 5_000;
        session.shared.apply_wire_event(
            &connection,
            WireEvent::Snapshot(PlaybackSnapshot {
                is_playing: Some(true),
                position_seconds: Some(10.0),
                server_timestamp_ms: Some(anchor_ms),
                ..PlaybackSnapshot::default()
            }),
        );
        session.update_progress(10.0);

        session.shared.resync_tick(&connection);

        let state = session.playback_state();
        assert!(
            state.position_seconds > 14.0,
            "expected correction near 15s, got {}",
            state.position_seconds
        );

        let mut saw_correction = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::CorrectionRequired(correction) = event {
                assert!(correction.offset_ms > 4_000.0);
                saw_correction = true;
            }
        }
        assert!(saw_correction);
    }

    #[tokio::test]
    async fn test_resync_tick_skips_when_aligned() {
        let (session, mut events) = listener_session();
        let connection = session.connection.clone();

        let anchor_ms = now_ms();
        session.shared.apply_wire_event(
            &connection,
            WireEvent::Snapshot(PlaybackSnapshot {
                is_playing: Some(true),
                position_seconds: Some(10.0),
                server_timestamp_ms: Some(anchor_ms),
                ..PlaybackSnapshot::default()
            }),
        );
        session.update_progress(10.0);

        session.shared.resync_tick(&connection);

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, SessionEvent::CorrectionRequired(_)),
                "no correction expected when aligned"
            );
        }
    }

    #[tokio::test]
    async fn test_session_joined_establishes_role() {
        let (session, mut events) = Session::new(
            Arc::new(MemoryPreferences::new()),
            SessionConfig::default(),
        );
        let connection = session.connection.clone();

        session.shared.apply_wire_event(
            &connection,
            WireEvent::SessionJoined {
                session_id: "ABCDEFGH".to_string(),
                role: Role::Host,
                participant_count: 1,
            },
        );

        assert!(session.is_host());
        let joined = events.try_recv().unwrap();
        assert!(matches!(joined, SessionEvent::Joined { role: Role::Host, .. }));

        session.shared.apply_wire_event(
            &connection,
            WireEvent::SessionParticipants {
                participant_count: 4,
            },
        );
        assert_eq!(session.session_state().unwrap().participant_count, 4);
    }

    #[tokio::test]
    async fn test_leave_resets_playback_but_keeps_volume() {
        let (session, _events) = host_session();

        session.set_volume(25);
        session
            .add_track(Track {
                id: "t1".to_string(),
                url: "https://x/a.mp3".to_string(),
                title: None,
                artist: None,
                duration_seconds: None,
                added_at_ms: 0,
            })
            .unwrap();
        session.select_track(0).unwrap();
        session.play().unwrap();

        session.leave_session().unwrap();

        let state = session.playback_state();
        assert!(!state.is_playing);
        assert_eq!(state.track_id, "");
        assert_eq!(state.volume, 25);
        assert!(session.session_state().is_none());
        assert!(session.playlist().is_empty());
    }

    #[tokio::test]
    async fn test_recommended_buffer_tracks_latency() {
        let (session, _events) = listener_session();
        // No probe measurements yet: low-latency tier applies
        let base = session.shared.config.sync.base_buffer_secs;
        assert_eq!(session.recommended_buffer_secs(), base);
    }

    #[tokio::test]
    async fn test_invalid_join_code_rejected() {
        let (session, _events) = Session::new(
            Arc::new(MemoryPreferences::new()),
            SessionConfig::default(),
        );
        assert!(matches!(
            session.join_session("nope"),
            Err(SessionError::InvalidSessionId(_))
        ));
    }
}
