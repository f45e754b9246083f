//! Wire Protocol Events
//!
//! Named events exchanged over the relay connection as JSON frames.

use serde::{Deserialize, Serialize};

use super::state::Role;

/// A playlist entry as it travels on the wire.
///
/// Internal bookkeeping fields (`added_at_ms`) are stripped before broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTrack {
    /// Library track ID
    pub id: String,
    /// Audio file URL
    pub url: String,
    /// Track title
    pub title: Option<String>,
    /// Artist name
    pub artist: Option<String>,
    /// Duration in seconds
    pub duration_seconds: Option<f64>,
}

/// A partial playback snapshot broadcast by the host.
///
/// Every field is optional: payloads from the wire may be missing fields or
/// carry malformed values, and the store validates/coalesces before merging.
/// Volume fields are only present on host control-plane messages; ordinary
/// position snapshots never carry them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_duration: Option<f64>,
    /// Epoch ms at which the host captured this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_volume: Option<u8>,
}

/// Events exchanged between clients and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum WireEvent {
    // === Session Management ===
    /// Create a new session (sender becomes host)
    #[serde(rename = "session:create")]
    SessionCreate,

    /// Join an existing session (sender becomes listener)
    #[serde(rename = "session:join")]
    SessionJoin { session_id: String },

    /// Relay's answer to create/join
    #[serde(rename = "session:joined")]
    SessionJoined {
        session_id: String,
        role: Role,
        participant_count: u32,
    },

    /// Participant count changed
    #[serde(rename = "session:participants")]
    SessionParticipants { participant_count: u32 },

    /// Leave the current session
    #[serde(rename = "session:leave")]
    SessionLeave,

    // === Playback Commands (from host) ===
    /// New anchor for reconciliation: the host switched tracks
    #[serde(rename = "audio:track-change")]
    TrackChange {
        track_id: String,
        track_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track_title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track_artist: Option<String>,
        timestamp_ms: i64,
    },

    /// Resume playback
    #[serde(rename = "audio:play")]
    Play { timestamp_ms: i64 },

    /// Pause playback
    #[serde(rename = "audio:pause")]
    Pause { timestamp_ms: i64 },

    /// Seek to a position
    #[serde(rename = "audio:seek")]
    Seek {
        position_seconds: f64,
        timestamp_ms: i64,
    },

    /// Periodic playback state (the heartbeat listeners anchor to)
    #[serde(rename = "audio:snapshot")]
    Snapshot(PlaybackSnapshot),

    // === Playlist ===
    /// Full replace of the playlist replica
    #[serde(rename = "playlist:update")]
    PlaylistUpdate { tracks: Vec<WireTrack> },

    // === Latency Probe ===
    /// Ping for measuring round-trip time
    #[serde(rename = "sync:ping")]
    Ping { sent_at_ms: i64 },

    /// Pong response for RTT calculation
    #[serde(rename = "sync:pong")]
    Pong {
        ping_sent_at_ms: i64,
        received_at_ms: i64,
    },

    // === Errors ===
    /// Relay-reported error
    #[serde(rename = "error")]
    Error { message: String },
}

impl WireEvent {
    /// Check if this event mutates playback/playlist state and therefore
    /// requires host privileges.
    pub fn requires_host(&self) -> bool {
        matches!(
            self,
            WireEvent::TrackChange { .. }
                | WireEvent::Play { .. }
                | WireEvent::Pause { .. }
                | WireEvent::Seek { .. }
                | WireEvent::Snapshot(_)
                | WireEvent::PlaylistUpdate { .. }
        )
    }

    /// The wire name of this event, as carried in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            WireEvent::SessionCreate => "session:create",
            WireEvent::SessionJoin { .. } => "session:join",
            WireEvent::SessionJoined { .. } => "session:joined",
            WireEvent::SessionParticipants { .. } => "session:participants",
            WireEvent::SessionLeave => "session:leave",
            WireEvent::TrackChange { .. } => "audio:track-change",
            WireEvent::Play { .. } => "audio:play",
            WireEvent::Pause { .. } => "audio:pause",
            WireEvent::Seek { .. } => "audio:seek",
            WireEvent::Snapshot(_) => "audio:snapshot",
            WireEvent::PlaylistUpdate { .. } => "playlist:update",
            WireEvent::Ping { .. } => "sync:ping",
            WireEvent::Pong { .. } => "sync:pong",
            WireEvent::Error { .. } => "error",
        }
    }
}
