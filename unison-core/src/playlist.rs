//! Playlist Synchronizer
//!
//! The host owns an ordered track list; every host-side mutation produces a
//! full-list broadcast payload. Listeners hold a replica that is replaced
//! wholesale by inbound `playlist:update` events - never merged.

use crate::sync::WireTrack;

/// A playlist entry with internal bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_seconds: Option<f64>,
    /// When the host added this track (epoch ms). Internal only, stripped
    /// from broadcasts.
    pub added_at_ms: i64,
}

impl Track {
    /// Wire form with internal fields stripped
    pub fn to_wire(&self) -> WireTrack {
        WireTrack {
            id: self.id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            duration_seconds: self.duration_seconds,
        }
    }

    fn from_wire(track: WireTrack) -> Self {
        Self {
            id: track.id,
            url: track.url,
            title: track.title,
            artist: track.artist,
            duration_seconds: track.duration_seconds,
            added_at_ms: 0,
        }
    }
}

/// Ordered track list with a current selection
#[derive(Debug, Clone, Default)]
pub struct PlaylistState {
    tracks: Vec<Track>,
    current_index: Option<usize>,
}

impl PlaylistState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks in playlist order
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Index of the currently selected track, if any
    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// The currently selected track, if any
    pub fn current_track(&self) -> Option<&Track> {
        self.current_index.and_then(|i| self.tracks.get(i))
    }

    pub fn track_at(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Append a track. Returns false (list unchanged) when a track with the
    /// same id already exists.
    pub fn add_track(&mut self, track: Track) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Remove a track by id, adjusting the current selection so it keeps
    /// pointing at the same track where possible.
    pub fn remove_track(&mut self, track_id: &str) -> Option<Track> {
        let removed_index = self.tracks.iter().position(|t| t.id == track_id)?;
        let removed = self.tracks.remove(removed_index);

        self.current_index = match self.current_index {
            Some(current) if current > removed_index => Some(current - 1),
            Some(current) if current == removed_index => {
                if self.tracks.is_empty() {
                    None
                } else {
                    Some(current.min(self.tracks.len() - 1))
                }
            }
            other => other,
        };

        Some(removed)
    }

    /// Select a track by index. Returns false when out of bounds.
    pub fn set_current_index(&mut self, index: usize) -> bool {
        if index < self.tracks.len() {
            self.current_index = Some(index);
            true
        } else {
            false
        }
    }

    pub fn clear_selection(&mut self) {
        self.current_index = None;
    }

    /// Broadcast payload: the full list with internal fields stripped
    pub fn to_wire(&self) -> Vec<WireTrack> {
        self.tracks.iter().map(Track::to_wire).collect()
    }

    /// Replace the replica wholesale from an inbound `playlist:update`.
    /// The selection survives only while it remains in bounds.
    pub fn apply_update(&mut self, tracks: Vec<WireTrack>) {
        self.tracks = tracks.into_iter().map(Track::from_wire).collect();
        if let Some(current) = self.current_index {
            if current >= self.tracks.len() {
                self.current_index = None;
            }
        }
    }
}
