//! Track controller - per-track playback state machine
//!
//! A track owns its decoded buffer, loop segment and the ids of its graph
//! nodes. Sources are one-shot: every start creates a fresh node, and every
//! stop tears the old one down, so the position of a playing track is
//! derived from the wall clock rather than read back from the audio thread.

use crate::buffer::DecodedBuffer;
use crate::effect::{EffectAdapter, PITCH_RANGE, TEMPO_RANGE};
use crate::error::{EngineError, Result};
use crate::graph::{GraphManager, NodeId, SourceSpec};
use crate::segment::{DragState, Marker, Segment, SegmentModel};
use std::sync::Arc;

/// Index of a track within the engine
pub type TrackId = usize;

/// Playback state for a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    /// Nothing has played since the last load
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Shared engine resources a track needs for one operation
pub struct TrackContext<'a> {
    pub graph: &'a mut GraphManager,
    pub effects: &'a EffectAdapter,
    /// Clock reading in seconds
    pub now: f64,
    pub gain_ramp_secs: f32,
}

/// Read-only view of a track for display
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub state: TrackState,
    pub has_buffer: bool,
    pub duration: f64,
    pub segment: Segment,
    /// Estimated position in seconds, always inside `segment`
    pub playhead: f64,
    pub looping: bool,
    pub tempo: f32,
    pub pitch: f32,
    pub gain: f32,
    /// Tempo and pitch are stored but not audible
    pub bypass_active: bool,
    pub drag: DragState,
}

/// A single loop-region playback track
pub struct Track {
    id: TrackId,
    buffer: Option<Arc<DecodedBuffer>>,
    state: TrackState,
    segment: SegmentModel,
    looping: bool,
    /// Resume position. Authoritative only while not playing.
    playback_offset: f64,
    /// Clock reading when the current source started
    playback_start: f64,
    tempo: f32,
    pitch: f32,
    gain: f32,
    source: Option<NodeId>,
    effect: Option<NodeId>,
    gain_node: Option<NodeId>,
    /// Bounds and loop flag the current source was started with
    active_region: Segment,
    active_looping: bool,
    /// Buffer seconds consumed per wall second by the current source
    active_rate: f64,
}

impl Track {
    pub fn new(id: TrackId, tolerance_px: f64, min_segment_secs: f64) -> Self {
        Self {
            id,
            buffer: None,
            state: TrackState::Idle,
            segment: SegmentModel::new(tolerance_px, min_segment_secs),
            looping: false,
            playback_offset: 0.0,
            playback_start: 0.0,
            tempo: 1.0,
            pitch: 0.0,
            gain: 1.0,
            source: None,
            effect: None,
            gain_node: None,
            active_region: Segment::default(),
            active_looping: false,
            active_rate: 1.0,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state == TrackState::Playing
    }

    pub fn duration(&self) -> f64 {
        self.buffer.as_ref().map_or(0.0, |b| b.duration())
    }

    pub fn segment(&self) -> Segment {
        self.segment.segment()
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Id of the source currently playing, if any
    pub fn source(&self) -> Option<NodeId> {
        self.source
    }

    /// Tempo and pitch have no audible effect on this track
    pub fn bypass_active(&self) -> bool {
        self.effect.is_none()
    }

    /// Install a new buffer, discarding prior playback and graph nodes.
    ///
    /// Segment, offset, loop flag and drag are reset. Tempo, pitch and gain
    /// carry over to the new buffer. If the old source cannot be stopped the
    /// track keeps its previous buffer.
    pub fn load(&mut self, buffer: Arc<DecodedBuffer>, cx: &mut TrackContext) -> Result<()> {
        self.release(cx)?;
        self.segment.reset(buffer.duration());
        self.buffer = Some(buffer);
        self.state = TrackState::Idle;
        self.looping = false;
        self.playback_offset = 0.0;
        self.active_rate = 1.0;
        tracing::debug!(
            track = self.id,
            duration = self.duration(),
            "track loaded"
        );
        Ok(())
    }

    /// Tear down every graph node this track owns
    pub fn release(&mut self, cx: &mut TrackContext) -> Result<()> {
        if let Some(node) = self.source {
            cx.graph.teardown_source(node)?;
            self.source = None;
        }
        if let Some(node) = self.effect.take() {
            cx.graph.release_node(node);
        }
        if let Some(node) = self.gain_node.take() {
            cx.graph.release_node(node);
        }
        Ok(())
    }

    /// Start playing from the resume position. A no-op while playing.
    pub fn start(&mut self, cx: &mut TrackContext) -> Result<()> {
        if self.state == TrackState::Playing {
            return Ok(());
        }
        let buffer = self
            .buffer
            .clone()
            .ok_or(EngineError::NotLoaded(self.id))?;

        let segment = self.segment.segment();
        if segment.is_empty() {
            return Err(EngineError::InvalidSegment {
                start: segment.start,
                end: segment.end,
            });
        }
        let mut offset = segment.clamp(self.playback_offset);
        if offset >= segment.end {
            offset = segment.start;
        }
        self.playback_offset = offset;

        let gain = match self.ensure_gain_node(cx) {
            Ok(node) => node,
            Err(e) => {
                self.state = TrackState::Paused;
                return Err(e);
            }
        };
        let effect = self.ensure_effect_node(cx);
        let spec = SourceSpec {
            buffer,
            offset,
            region: segment,
            looping: self.looping,
        };

        match cx.graph.create_source(spec, effect, gain) {
            Ok(node) => {
                self.source = Some(node);
                self.state = TrackState::Playing;
                self.playback_start = cx.now;
                self.active_region = segment;
                self.active_looping = self.looping;
                self.active_rate = match effect {
                    Some(_) => self.tempo as f64,
                    None => 1.0,
                };
                tracing::debug!(track = self.id, offset, looping = self.looping, "track started");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(track = self.id, "failed to start source: {e}");
                self.state = TrackState::Paused;
                Err(e.into())
            }
        }
    }

    /// Stop playback and remember where it was. Returns whether the track was playing.
    ///
    /// If the renderer cannot be reached the track keeps playing with its
    /// current source, and the stop can be retried.
    pub fn stop(&mut self, cx: &mut TrackContext) -> Result<bool> {
        if self.state != TrackState::Playing {
            return Ok(false);
        }
        let position = self.live_position(cx.now);
        if let Some(node) = self.source {
            cx.graph.teardown_source(node)?;
            self.source = None;
        }

        let segment = self.segment.segment();
        let mut offset = segment.clamp(position);
        if offset >= segment.end {
            offset = segment.start;
        }
        self.playback_offset = offset;
        self.state = TrackState::Paused;
        tracing::debug!(track = self.id, offset, "track stopped");
        Ok(true)
    }

    /// Stop and start again so a new source picks up the current settings
    pub fn restart(&mut self, cx: &mut TrackContext) -> Result<()> {
        if !self.stop(cx)? {
            return Ok(());
        }
        self.start(cx)
    }

    /// Handle a completion event from the audio thread.
    ///
    /// Only the current, non-looping source of a playing track can end it.
    /// Anything else is stale and ignored. Returns whether the event applied.
    pub fn on_source_ended(&mut self, node: NodeId, cx: &mut TrackContext) -> bool {
        let current = self.source == Some(node)
            && self.state == TrackState::Playing
            && !self.active_looping;
        if !current {
            tracing::trace!(track = self.id, ?node, "ignoring stale completion");
            return false;
        }
        self.source = None;
        cx.graph.forget_source(node);
        self.state = TrackState::Paused;
        self.playback_offset = self.segment.segment().start;
        tracing::debug!(track = self.id, "track reached segment end");
        true
    }

    pub fn set_looping(&mut self, looping: bool, cx: &mut TrackContext) -> Result<()> {
        if self.looping == looping {
            return Ok(());
        }
        self.looping = looping;
        self.restart(cx)
    }

    /// Set the tempo multiplier, clamped to the supported range
    pub fn set_tempo(&mut self, tempo: f32, cx: &mut TrackContext) -> Result<()> {
        if !tempo.is_finite() || tempo <= 0.0 {
            return Err(EngineError::InvalidParameter {
                name: "tempo",
                value: tempo as f64,
            });
        }
        self.tempo = tempo.clamp(TEMPO_RANGE.0, TEMPO_RANGE.1);

        let Some(effect) = self.effect else {
            return Ok(());
        };
        cx.graph.set_effect_params(effect, self.tempo, self.pitch)?;

        // Rebase so elapsed time before and after the change is counted at the right rate
        if self.state == TrackState::Playing {
            self.playback_offset = self.live_position(cx.now);
            self.playback_start = cx.now;
            self.active_rate = self.tempo as f64;
        }
        Ok(())
    }

    /// Set the pitch shift in semitones, clamped to the supported range
    pub fn set_pitch(&mut self, semitones: f32, cx: &mut TrackContext) -> Result<()> {
        if !semitones.is_finite() {
            return Err(EngineError::InvalidParameter {
                name: "pitch",
                value: semitones as f64,
            });
        }
        self.pitch = semitones.clamp(PITCH_RANGE.0, PITCH_RANGE.1);
        if let Some(effect) = self.effect {
            cx.graph.set_effect_params(effect, self.tempo, self.pitch)?;
        }
        Ok(())
    }

    pub fn set_gain(&mut self, gain: f32, cx: &mut TrackContext) -> Result<()> {
        if !gain.is_finite() {
            return Err(EngineError::InvalidParameter {
                name: "gain",
                value: gain as f64,
            });
        }
        self.gain = gain.clamp(0.0, 2.0);
        if let Some(node) = self.gain_node {
            cx.graph.set_gain(node, self.gain, cx.gain_ramp_secs)?;
        }
        Ok(())
    }

    /// Replace the segment outright
    pub fn set_segment(&mut self, start: f64, end: f64, cx: &mut TrackContext) -> Result<()> {
        if self.buffer.is_none() {
            return Err(EngineError::NotLoaded(self.id));
        }
        self.segment.set(start, end, self.duration())?;
        self.after_segment_edit(cx)
    }

    /// Which marker lies under `x` in a view `width` pixels wide
    pub fn hit_test(&self, x: f64, width: f64) -> Marker {
        self.segment.hit_test(x, width, self.duration())
    }

    /// Start dragging the marker under `x`, if any
    pub fn begin_drag(&mut self, x: f64, width: f64) -> Marker {
        let marker = self.hit_test(x, width);
        self.segment.begin_drag(marker);
        marker
    }

    /// Move the dragged marker. Restarts playback when the moved boundary
    /// passes the live playhead.
    pub fn update_drag(&mut self, x: f64, width: f64, cx: &mut TrackContext) -> Result<Marker> {
        let playhead = match self.state {
            TrackState::Playing => Some(self.live_position(cx.now)),
            _ => None,
        };
        let moved = self.segment.update_drag(x, width, self.duration());
        let segment = self.segment.segment();

        match (moved, playhead) {
            (Marker::None, _) => {}
            (_, None) => self.playback_offset = segment.clamp(self.playback_offset),
            (Marker::Start, Some(p)) if segment.start > p => self.restart(cx)?,
            (Marker::End, Some(p)) if segment.end <= p => self.restart(cx)?,
            _ => {}
        }
        Ok(moved)
    }

    /// Finish the drag and bring a playing source in line with the final bounds
    pub fn end_drag(&mut self, cx: &mut TrackContext) -> Result<()> {
        if !self.segment.end_drag() {
            return Ok(());
        }
        self.after_segment_edit(cx)
    }

    fn after_segment_edit(&mut self, cx: &mut TrackContext) -> Result<()> {
        let segment = self.segment.segment();
        if self.state == TrackState::Playing {
            if segment != self.active_region {
                self.restart(cx)?;
            }
        } else {
            self.playback_offset = segment.clamp(self.playback_offset);
        }
        Ok(())
    }

    /// Estimated position in seconds, clamped to the current segment
    pub fn playhead(&self, now: f64) -> f64 {
        let segment = self.segment.segment();
        match self.state {
            TrackState::Playing => segment.clamp(self.live_position(now)),
            _ => segment.clamp(self.playback_offset),
        }
    }

    pub fn snapshot(&self, now: f64) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            state: self.state,
            has_buffer: self.buffer.is_some(),
            duration: self.duration(),
            segment: self.segment.segment(),
            playhead: self.playhead(now),
            looping: self.looping,
            tempo: self.tempo,
            pitch: self.pitch,
            gain: self.gain,
            bypass_active: self.bypass_active(),
            drag: self.segment.drag(),
        }
    }

    /// Where the current source is, by elapsed time at its consumption rate
    fn live_position(&self, now: f64) -> f64 {
        let elapsed = (now - self.playback_start).max(0.0) * self.active_rate;
        let raw = self.playback_offset + elapsed;
        if self.active_looping {
            self.active_region.wrap(raw)
        } else {
            raw.min(self.active_region.end)
        }
    }

    fn ensure_gain_node(&mut self, cx: &mut TrackContext) -> Result<NodeId> {
        if let Some(node) = self.gain_node {
            return Ok(node);
        }
        let node = cx.graph.create_gain(self.gain)?;
        self.gain_node = Some(node);
        Ok(node)
    }

    /// Effect node for this track, created with the pending tempo and pitch.
    /// `None` means the source plays in bypass.
    fn ensure_effect_node(&mut self, cx: &mut TrackContext) -> Option<NodeId> {
        if self.effect.is_some() {
            return self.effect;
        }
        let mut unit = cx.effects.instantiate()?;
        unit.set_tempo(self.tempo);
        unit.set_semitones(self.pitch);
        match cx.graph.create_effect(unit) {
            Ok(node) => {
                self.effect = Some(node);
                Some(node)
            }
            Err(e) => {
                tracing::warn!(track = self.id, "effect node unavailable, using bypass: {e}");
                None
            }
        }
    }
}
