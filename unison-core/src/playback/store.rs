//! Playback State Store
//!
//! A reducer-style store: every mutation is a total, side-effect-free
//! transition `(state, action) -> state`. The store wrapper owns the one
//! side effect - persisting the locally-owned volume fields through the
//! injected preferences provider.
//!
//! Ownership split: `volume`, `is_muted`, and `previous_volume` belong to
//! this client and are never overwritten by an ordinary remote merge.
//! Everything else is replica state for listeners and authoritative state
//! for the host.

use std::sync::Arc;

use crate::storage::{PreferencesProvider, StoredPrefs};
use crate::sync::PlaybackSnapshot;

use super::track::is_audio_url;

/// Full playback state for one participant
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub is_playing: bool,
    /// Current position in seconds, advanced by player progress reports
    pub position_seconds: f64,
    pub volume: u8,
    pub is_muted: bool,
    pub previous_volume: u8,
    pub track_id: String,
    pub track_url: String,
    pub track_title: Option<String>,
    pub track_artist: Option<String>,
    pub track_duration: Option<f64>,
    /// Position at the last authoritative update; together with
    /// `server_timestamp_ms` this is the anchor reconciliation projects from
    pub anchor_position_seconds: f64,
    /// Epoch ms of the last authoritative update
    pub server_timestamp_ms: i64,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl PlaybackState {
    /// Initial state with volume fields loaded from stored preferences
    pub fn with_prefs(prefs: &StoredPrefs) -> Self {
        Self {
            is_playing: false,
            position_seconds: 0.0,
            volume: if prefs.is_muted {
                0
            } else {
                prefs.volume.min(100)
            },
            is_muted: prefs.is_muted,
            previous_volume: prefs.previous_volume.min(100),
            track_id: String::new(),
            track_url: String::new(),
            track_title: None,
            track_artist: None,
            track_duration: None,
            anchor_position_seconds: 0.0,
            server_timestamp_ms: 0,
            is_loading: false,
            last_error: None,
        }
    }

    /// Estimate the current position by projecting the anchor forward.
    /// Used by the host to stamp heartbeats when no player progress report
    /// is available.
    pub fn estimated_position(&self, now_ms: i64) -> f64 {
        if !self.is_playing {
            return self.position_seconds;
        }
        let elapsed_secs = (now_ms - self.server_timestamp_ms).max(0) as f64 / 1000.0;
        (self.anchor_position_seconds + elapsed_secs).max(0.0)
    }

    /// Build the host's periodic anchor snapshot. Volume fields are locally
    /// owned and never travel in ordinary snapshots.
    pub fn host_snapshot(&self, now_ms: i64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            is_playing: Some(self.is_playing),
            position_seconds: Some(self.estimated_position(now_ms)),
            track_id: Some(self.track_id.clone()),
            track_url: Some(self.track_url.clone()),
            track_title: self.track_title.clone(),
            track_artist: self.track_artist.clone(),
            track_duration: self.track_duration,
            server_timestamp_ms: Some(now_ms),
            volume: None,
            is_muted: None,
            previous_volume: None,
        }
    }
}

/// Mutations accepted by the store
#[derive(Debug, Clone)]
pub enum PlaybackAction {
    /// Load a new track. Rejected (only `last_error` changes) when the URL
    /// fails audio validation.
    SetTrack {
        track_id: String,
        track_url: String,
        track_title: Option<String>,
        track_artist: Option<String>,
    },
    /// Merge an inbound authoritative snapshot
    ApplyRemoteSnapshot(PlaybackSnapshot),
    /// Start playback, stamping a new reconciliation anchor
    Play { timestamp_ms: i64 },
    /// Pause playback, stamping a new reconciliation anchor
    Pause { timestamp_ms: i64 },
    /// Jump to a position, stamping a new reconciliation anchor
    Seek {
        position_seconds: f64,
        timestamp_ms: i64,
    },
    /// Player progress report; moves the position without touching the anchor
    UpdateProgress { position_seconds: f64 },
    /// Corrective seek from the reconciliation engine; position only
    ApplyCorrection { position_seconds: f64 },
    SetVolume { volume: u8 },
    ToggleMute,
    /// Return to defaults when leaving a session
    Reset { prefs: StoredPrefs },
}

/// Pure transition function. Total: every action yields a state, malformed
/// numeric inputs are coalesced rather than propagated.
pub fn reduce(state: &PlaybackState, action: &PlaybackAction) -> PlaybackState {
    let mut next = state.clone();

    match action {
        PlaybackAction::SetTrack {
            track_id,
            track_url,
            track_title,
            track_artist,
        } => {
            if !is_audio_url(track_url) {
                next.last_error = Some(format!("not a playable audio URL: {}", track_url));
                return next;
            }
            next.track_id = track_id.clone();
            next.track_url = track_url.clone();
            next.track_title = track_title.clone();
            next.track_artist = track_artist.clone();
            next.track_duration = None;
            next.position_seconds = 0.0;
            next.anchor_position_seconds = 0.0;
            next.is_loading = true;
            next.last_error = None;
        }

        PlaybackAction::ApplyRemoteSnapshot(snapshot) => {
            apply_snapshot(&mut next, snapshot);
        }

        PlaybackAction::Play { timestamp_ms } => {
            next.is_playing = true;
            next.anchor_position_seconds = next.position_seconds;
            next.server_timestamp_ms = *timestamp_ms;
        }

        PlaybackAction::Pause { timestamp_ms } => {
            next.is_playing = false;
            next.anchor_position_seconds = next.position_seconds;
            next.server_timestamp_ms = *timestamp_ms;
        }

        PlaybackAction::Seek {
            position_seconds,
            timestamp_ms,
        } => {
            if let Some(position) = valid_position(*position_seconds) {
                next.position_seconds = position;
                next.anchor_position_seconds = position;
                next.server_timestamp_ms = *timestamp_ms;
            }
        }

        PlaybackAction::UpdateProgress { position_seconds } => {
            if let Some(position) = valid_position(*position_seconds) {
                next.position_seconds = position;
            }
        }

        PlaybackAction::ApplyCorrection { position_seconds } => {
            if let Some(position) = valid_position(*position_seconds) {
                next.position_seconds = position;
            }
        }

        PlaybackAction::SetVolume { volume } => {
            let volume = (*volume).min(100);
            if volume > 0 {
                next.volume = volume;
                next.previous_volume = volume;
                next.is_muted = false;
            } else {
                next.volume = 0;
                // Mute state is preserved when already muted; an explicit
                // slide to zero otherwise keeps previous_volume, except a
                // degenerate value which resets to the safety default.
                if !next.is_muted && (next.previous_volume == 0 || next.previous_volume == 100) {
                    next.previous_volume = 100;
                }
            }
        }

        PlaybackAction::ToggleMute => {
            if next.is_muted {
                next.volume = if next.previous_volume > 0 {
                    next.previous_volume
                } else {
                    100
                };
                next.is_muted = false;
            } else {
                next.previous_volume = if next.volume > 0 { next.volume } else { 100 };
                next.volume = 0;
                next.is_muted = true;
            }
        }

        PlaybackAction::Reset { prefs } => {
            next = PlaybackState::with_prefs(prefs);
        }
    }

    next
}

/// Merge an inbound snapshot field by field, coalescing malformed values.
fn apply_snapshot(state: &mut PlaybackState, snapshot: &PlaybackSnapshot) {
    // Never rewind the anchor: a snapshot stamped before the one we already
    // hold is stale (the wire gives no ordering guarantee across reconnects).
    let stale = matches!(
        snapshot.server_timestamp_ms,
        Some(ts) if ts < state.server_timestamp_ms
    );

    if !stale {
        if let Some(playing) = snapshot.is_playing {
            state.is_playing = playing;
        }

        if let Some(position) = snapshot.position_seconds.and_then(valid_position) {
            state.position_seconds = position;
            state.anchor_position_seconds = position;
        }

        if let Some(ts) = snapshot.server_timestamp_ms {
            state.server_timestamp_ms = ts;
        }

        // An invalid incoming URL is never adopted; the previously valid
        // track keeps playing.
        if let Some(url) = snapshot.track_url.as_deref() {
            if is_audio_url(url) {
                state.track_url = url.to_string();
            }
        }

        if let Some(id) = &snapshot.track_id {
            state.track_id = id.clone();
        }
        if let Some(title) = &snapshot.track_title {
            state.track_title = Some(title.clone());
        }
        if let Some(artist) = &snapshot.track_artist {
            state.track_artist = Some(artist.clone());
        }
        if let Some(duration) = snapshot.track_duration.and_then(valid_position) {
            state.track_duration = Some(duration);
        }

        // Locally-owned fields move only when the payload explicitly carries
        // them (host control-plane messages); ordinary snapshots leave them.
        if let Some(volume) = snapshot.volume {
            state.volume = volume.min(100);
        }
        if let Some(muted) = snapshot.is_muted {
            state.is_muted = muted;
        }
        if let Some(previous) = snapshot.previous_volume {
            state.previous_volume = previous.min(100);
        }
        if state.is_muted {
            state.volume = 0;
        }
    }

    state.is_loading = false;
    state.last_error = None;
}

/// Coalesce a wire numeric: finite values clamp to >= 0, anything else is
/// discarded.
fn valid_position(value: f64) -> Option<f64> {
    value.is_finite().then(|| value.max(0.0))
}

/// Store wrapper: pure transitions inside, preference persistence at the
/// boundary.
pub struct PlaybackStore {
    state: PlaybackState,
    prefs: Arc<dyn PreferencesProvider>,
}

impl PlaybackStore {
    /// Create a store, loading persisted volume/mute at init
    pub fn new(prefs: Arc<dyn PreferencesProvider>) -> Self {
        let state = PlaybackState::with_prefs(&prefs.load());
        Self { state, prefs }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Apply an action; persists volume fields when they changed.
    pub fn dispatch(&mut self, action: PlaybackAction) -> &PlaybackState {
        let next = reduce(&self.state, &action);

        let volume_changed = next.volume != self.state.volume
            || next.is_muted != self.state.is_muted
            || next.previous_volume != self.state.previous_volume;

        self.state = next;

        if volume_changed {
            let mut stored = self.prefs.load();
            stored.volume = if self.state.is_muted {
                self.state.previous_volume
            } else {
                self.state.volume
            };
            stored.is_muted = self.state.is_muted;
            stored.previous_volume = self.state.previous_volume;
            self.prefs.save(&stored);
        }

        &self.state
    }

    /// Reset to defaults (volume fields reloaded from preferences)
    pub fn reset(&mut self) -> &PlaybackState {
        self.state = PlaybackState::with_prefs(&self.prefs.load());
        &self.state
    }
}
