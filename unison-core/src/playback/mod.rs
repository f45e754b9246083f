//! Playback State Store
//!
//! Authoritative-for-host / replica-for-listener playback state.

mod store;
mod track;

pub use store::{reduce, PlaybackAction, PlaybackState, PlaybackStore};
pub use track::is_audio_url;
