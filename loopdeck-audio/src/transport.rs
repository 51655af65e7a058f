//! Play-all / stop-all across every track

use crate::track::{Track, TrackContext};

/// Aggregate transport state, derived from the tracks on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportState {
    pub any_loaded: bool,
    pub any_playing: bool,
}

impl TransportState {
    pub fn of(tracks: &[Track]) -> Self {
        let mut state = Self::default();
        for track in tracks.iter().filter(|t| t.is_loaded()) {
            state.any_loaded = true;
            state.any_playing |= track.is_playing();
        }
        state
    }

    /// Label for the master toggle control
    pub fn label(&self) -> &'static str {
        if self.any_playing {
            "Stop All"
        } else {
            "Play All"
        }
    }
}

/// Stop everything if anything is playing, otherwise start every loaded track.
///
/// Only tracks whose state disagrees with the target are touched. A track
/// that fails to start is logged and skipped.
pub fn toggle_all(tracks: &mut [Track], cx: &mut TrackContext) -> TransportState {
    let before = TransportState::of(tracks);
    if !before.any_loaded {
        return before;
    }

    for track in tracks.iter_mut().filter(|t| t.is_loaded()) {
        if before.any_playing {
            if let Err(e) = track.stop(cx) {
                tracing::warn!(track = track.id(), "stop all: {e}");
            }
        } else if !track.is_playing() {
            if let Err(e) = track.start(cx) {
                tracing::warn!(track = track.id(), "play all: {e}");
            }
        }
    }

    let after = TransportState::of(tracks);
    tracing::debug!(any_playing = after.any_playing, "transport toggled");
    after
}
