//! Engine - owns the tracks and drives them from the control thread

use crate::buffer::{DecodedBuffer, Decoder};
use crate::clock::Clock;
use crate::effect::{EffectAdapter, FftSize};
use crate::error::{EngineError, Result};
use crate::gain::GainStage;
use crate::graph::{GraphCommand, GraphEvent, GraphManager};
use crate::render::Renderer;
use crate::segment::Marker;
use crate::track::{Track, TrackContext, TrackId, TrackSnapshot};
use crate::transport::{self, TransportState};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;

/// Engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub track_count: usize,
    /// Pixel distance within which a press grabs a marker
    pub marker_tolerance_px: f64,
    /// Smallest allowed segment length in seconds
    pub min_segment_secs: f64,
    /// Track gain ramp duration in seconds
    pub gain_ramp_secs: f32,
    pub fft_size: FftSize,
    /// Capacity of the command and event channels
    pub command_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            track_count: 4,
            marker_tolerance_px: 5.0,
            min_segment_secs: 0.001,
            gain_ramp_secs: 0.05,
            fft_size: FftSize::Medium,
            command_queue: 1024,
        }
    }
}

/// Control-thread handle to the playback graph.
///
/// Every operation takes `&mut self`, so per-track operations never
/// interleave. The matching [`Renderer`] runs on the audio thread.
pub struct Engine {
    tracks: Vec<Track>,
    graph: GraphManager,
    effects: EffectAdapter,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    events: Receiver<GraphEvent>,
}

impl Engine {
    /// Create an engine with the phase vocoder effect and its renderer
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>, output_rate: u32) -> (Self, Renderer) {
        let effects = EffectAdapter::vocoder(config.fft_size);
        Self::with_effects(config, effects, clock, output_rate)
    }

    pub fn with_effects(
        config: EngineConfig,
        effects: EffectAdapter,
        clock: Arc<dyn Clock>,
        output_rate: u32,
    ) -> (Self, Renderer) {
        let (cmd_tx, cmd_rx, evt_tx, evt_rx) = Self::create_channels(config.command_queue);
        let renderer = Renderer::new(cmd_rx, evt_tx, output_rate);
        let tracks = (0..config.track_count)
            .map(|id| Track::new(id, config.marker_tolerance_px, config.min_segment_secs))
            .collect();

        tracing::info!(
            tracks = config.track_count,
            sample_rate = output_rate,
            "engine created"
        );
        let engine = Self {
            tracks,
            graph: GraphManager::new(cmd_tx),
            effects,
            clock,
            config,
            events: evt_rx,
        };
        (engine, renderer)
    }

    /// Create channels for engine communication
    pub fn create_channels(
        capacity: usize,
    ) -> (
        Sender<GraphCommand>,
        Receiver<GraphCommand>,
        Sender<GraphEvent>,
        Receiver<GraphEvent>,
    ) {
        let (cmd_tx, cmd_rx) = bounded(capacity);
        let (evt_tx, evt_rx) = bounded(capacity);
        (cmd_tx, cmd_rx, evt_tx, evt_rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared effect adapter. Drive [`EffectAdapter::ensure_loaded`] on an async runtime.
    pub fn effects(&self) -> &EffectAdapter {
        &self.effects
    }

    /// Effect module failed to load and every track plays unprocessed
    pub fn bypass_active(&self) -> bool {
        self.effects.bypass_active()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(id)
    }

    /// Run `f` against one track with the shared resources it needs
    fn with_track<R>(
        &mut self,
        id: TrackId,
        f: impl FnOnce(&mut Track, &mut TrackContext) -> Result<R>,
    ) -> Result<R> {
        let track = self
            .tracks
            .get_mut(id)
            .ok_or(EngineError::UnknownTrack(id))?;
        let mut cx = TrackContext {
            graph: &mut self.graph,
            effects: &self.effects,
            now: self.clock.now(),
            gain_ramp_secs: self.config.gain_ramp_secs,
        };
        f(track, &mut cx)
    }

    /// Install an already decoded buffer on a track
    pub fn load_buffer(&mut self, id: TrackId, buffer: DecodedBuffer) -> Result<()> {
        let buffer = Arc::new(buffer);
        self.with_track(id, |track, cx| track.load(buffer, cx))
    }

    /// Decode `bytes` and install the result. On failure the track is untouched.
    pub fn load_encoded(
        &mut self,
        id: TrackId,
        bytes: Vec<u8>,
        hint: Option<&str>,
        decoder: &dyn Decoder,
    ) -> Result<()> {
        if id >= self.tracks.len() {
            return Err(EngineError::UnknownTrack(id));
        }
        let buffer = decoder.decode(bytes, hint).map_err(|e| {
            tracing::warn!(track = id, "decode failed: {e}");
            EngineError::from(e)
        })?;
        self.load_buffer(id, buffer)
    }

    pub fn start(&mut self, id: TrackId) -> Result<()> {
        self.with_track(id, |track, cx| track.start(cx))
    }

    /// Stop a track. Returns whether it was playing.
    pub fn stop(&mut self, id: TrackId) -> Result<bool> {
        self.with_track(id, |track, cx| track.stop(cx))
    }

    pub fn restart(&mut self, id: TrackId) -> Result<()> {
        self.with_track(id, |track, cx| track.restart(cx))
    }

    pub fn set_looping(&mut self, id: TrackId, looping: bool) -> Result<()> {
        self.with_track(id, |track, cx| track.set_looping(looping, cx))
    }

    pub fn set_tempo(&mut self, id: TrackId, tempo: f32) -> Result<()> {
        self.with_track(id, |track, cx| track.set_tempo(tempo, cx))
    }

    pub fn set_pitch(&mut self, id: TrackId, semitones: f32) -> Result<()> {
        self.with_track(id, |track, cx| track.set_pitch(semitones, cx))
    }

    pub fn set_gain(&mut self, id: TrackId, gain: f32) -> Result<()> {
        self.with_track(id, |track, cx| track.set_gain(gain, cx))
    }

    pub fn set_segment(&mut self, id: TrackId, start: f64, end: f64) -> Result<()> {
        self.with_track(id, |track, cx| track.set_segment(start, end, cx))
    }

    pub fn set_master_gain(&mut self, level: f32) -> Result<()> {
        if !level.is_finite() {
            return Err(EngineError::InvalidParameter {
                name: "master",
                value: level as f64,
            });
        }
        let level = level.clamp(0.0, GainStage::MAX_LEVEL);
        self.graph
            .set_master_gain(level, self.config.gain_ramp_secs)?;
        Ok(())
    }

    pub fn master_gain(&self) -> f32 {
        self.graph.master_level()
    }

    /// Press at `x` in a view `width` pixels wide. Returns the grabbed marker.
    pub fn begin_drag(&mut self, id: TrackId, x: f64, width: f64) -> Result<Marker> {
        self.with_track(id, |track, _| Ok(track.begin_drag(x, width)))
    }

    pub fn update_drag(&mut self, id: TrackId, x: f64, width: f64) -> Result<Marker> {
        self.with_track(id, |track, cx| track.update_drag(x, width, cx))
    }

    pub fn end_drag(&mut self, id: TrackId) -> Result<()> {
        self.with_track(id, |track, cx| track.end_drag(cx))
    }

    /// Master play/stop toggle
    pub fn toggle_all(&mut self) -> TransportState {
        let mut cx = TrackContext {
            graph: &mut self.graph,
            effects: &self.effects,
            now: self.clock.now(),
            gain_ramp_secs: self.config.gain_ramp_secs,
        };
        transport::toggle_all(&mut self.tracks, &mut cx)
    }

    pub fn transport(&self) -> TransportState {
        TransportState::of(&self.tracks)
    }

    pub fn snapshot(&self, id: TrackId) -> Result<TrackSnapshot> {
        let track = self.tracks.get(id).ok_or(EngineError::UnknownTrack(id))?;
        Ok(track.snapshot(self.clock.now()))
    }

    pub fn snapshots(&self) -> Vec<TrackSnapshot> {
        let now = self.clock.now();
        self.tracks.iter().map(|t| t.snapshot(now)).collect()
    }

    /// Apply completion events from the audio thread. Returns how many ended a track.
    pub fn poll_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            if self.handle_event(event) {
                applied += 1;
            }
        }
        applied
    }

    fn handle_event(&mut self, event: GraphEvent) -> bool {
        match event {
            GraphEvent::SourceEnded(node) => {
                let mut cx = TrackContext {
                    graph: &mut self.graph,
                    effects: &self.effects,
                    now: self.clock.now(),
                    gain_ramp_secs: self.config.gain_ramp_secs,
                };
                let owner = self.tracks.iter_mut().find(|t| t.source() == Some(node));
                match owner {
                    Some(track) => track.on_source_ended(node, &mut cx),
                    None => {
                        tracing::trace!(?node, "completion for a source no track owns");
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::effect::{EffectLoadError, EffectStatus, ModuleLoader, StretchModule};
    use crate::error::DecodeError;
    use crate::segment::Segment;
    use crate::track::TrackState;

    const RATE: u32 = 1000;

    struct MissingModule;

    impl ModuleLoader for MissingModule {
        fn load(&self) -> std::result::Result<StretchModule, EffectLoadError> {
            Err(EffectLoadError::Unavailable("test".into()))
        }
    }

    struct FailingDecoder;

    impl Decoder for FailingDecoder {
        fn decode(
            &self,
            _bytes: Vec<u8>,
            _hint: Option<&str>,
        ) -> std::result::Result<DecodedBuffer, DecodeError> {
            Err(DecodeError::UnsupportedFormat)
        }
    }

    struct RawDecoder;

    impl Decoder for RawDecoder {
        fn decode(
            &self,
            bytes: Vec<u8>,
            _hint: Option<&str>,
        ) -> std::result::Result<DecodedBuffer, DecodeError> {
            let samples = bytes.iter().map(|b| *b as f32 / 255.0).collect();
            DecodedBuffer::new(vec![samples], RATE)
        }
    }

    fn engine_with(effects: EffectAdapter) -> (Engine, Renderer, ManualClock) {
        let clock = ManualClock::new();
        let (engine, renderer) = Engine::with_effects(
            EngineConfig::default(),
            effects,
            Arc::new(clock.clone()),
            RATE,
        );
        (engine, renderer, clock)
    }

    fn ready_engine() -> (Engine, Renderer, ManualClock) {
        let effects = EffectAdapter::vocoder(FftSize::Small);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(rt.block_on(effects.ensure_loaded()), EffectStatus::Ready);
        engine_with(effects)
    }

    fn buffer(secs: f64) -> DecodedBuffer {
        let frames = (secs * RATE as f64) as usize;
        DecodedBuffer::new(vec![vec![0.25; frames]], RATE).unwrap()
    }

    fn render_secs(renderer: &mut Renderer, clock: &ManualClock, secs: f64) {
        let frames = (secs * RATE as f64) as usize;
        let mut block = vec![0.0f32; 2 * 100];
        for _ in 0..frames / 100 {
            renderer.process(&mut block);
        }
        clock.advance(secs);
    }

    #[test]
    fn test_play_stop_resume() {
        let (mut engine, _renderer, clock) = ready_engine();
        engine.load_buffer(0, buffer(10.0)).unwrap();
        engine.start(0).unwrap();
        clock.advance(3.0);
        assert!(engine.stop(0).unwrap());

        let snap = engine.snapshot(0).unwrap();
        assert_eq!(snap.state, TrackState::Paused);
        assert!((snap.playhead - 3.0).abs() < 1e-9);

        engine.start(0).unwrap();
        clock.advance(1.0);
        assert!((engine.snapshot(0).unwrap().playhead - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_looping_never_completes() {
        let (mut engine, mut renderer, clock) = ready_engine();
        engine.load_buffer(0, buffer(2.0)).unwrap();
        engine.set_segment(0, 0.5, 1.0).unwrap();
        engine.set_looping(0, true).unwrap();
        engine.start(0).unwrap();

        render_secs(&mut renderer, &clock, 2.0);
        assert_eq!(engine.poll_events(), 0);
        let snap = engine.snapshot(0).unwrap();
        assert_eq!(snap.state, TrackState::Playing);
        assert!(Segment::new(0.5, 1.0).contains(snap.playhead));
    }

    #[test]
    fn test_one_shot_completes_and_rewinds() {
        let (mut engine, mut renderer, clock) = engine_with(EffectAdapter::new(MissingModule));
        engine.load_buffer(1, buffer(2.0)).unwrap();
        engine.set_segment(1, 0.2, 0.5).unwrap();
        engine.start(1).unwrap();

        render_secs(&mut renderer, &clock, 0.5);
        assert_eq!(engine.poll_events(), 1);
        let snap = engine.snapshot(1).unwrap();
        assert_eq!(snap.state, TrackState::Paused);
        assert_eq!(snap.playhead, 0.2);
        assert_eq!(renderer.active_sources(), 0);
    }

    #[test]
    fn test_late_completion_after_restart_is_ignored() {
        let (mut engine, mut renderer, clock) = engine_with(EffectAdapter::new(MissingModule));
        engine.load_buffer(0, buffer(2.0)).unwrap();
        engine.set_segment(0, 0.0, 0.3).unwrap();
        engine.start(0).unwrap();

        // The first source ends on the audio thread before the restart is seen
        render_secs(&mut renderer, &clock, 0.5);
        engine.restart(0).unwrap();
        assert_eq!(engine.poll_events(), 0);
        assert_eq!(engine.snapshot(0).unwrap().state, TrackState::Playing);
    }

    #[test]
    fn test_drag_end_marker_clamps_to_min_length() {
        let (mut engine, _renderer, _clock) = ready_engine();
        engine.load_buffer(0, buffer(10.0)).unwrap();
        engine.set_segment(0, 2.0, 8.0).unwrap();

        // End marker at 8s is x = 800 in a 1000px view
        assert_eq!(engine.begin_drag(0, 800.0, 1000.0).unwrap(), Marker::End);
        engine.update_drag(0, 100.0, 1000.0).unwrap();
        engine.end_drag(0).unwrap();

        let snap = engine.snapshot(0).unwrap();
        assert_eq!(snap.segment.start, 2.0);
        assert!((snap.segment.end - 2.001).abs() < 1e-9);
        assert!(!snap.drag.active);
    }

    #[test]
    fn test_toggle_all_mixed_tracks() {
        let (mut engine, _renderer, _clock) = ready_engine();
        engine.load_buffer(0, buffer(5.0)).unwrap();
        engine.load_buffer(1, buffer(5.0)).unwrap();
        engine.load_buffer(2, buffer(5.0)).unwrap();
        engine.start(0).unwrap();

        let state = engine.toggle_all();
        assert!(state.any_loaded);
        assert!(!state.any_playing);
        assert!(engine.snapshots().iter().all(|s| s.state != TrackState::Playing));

        let state = engine.toggle_all();
        assert!(state.any_playing);
        let playing: Vec<bool> = engine
            .snapshots()
            .iter()
            .map(|s| s.state == TrackState::Playing)
            .collect();
        assert_eq!(playing, vec![true, true, true, false]);
        assert_eq!(engine.transport(), state);
    }

    #[test]
    fn test_bypass_keeps_parameters() {
        let effects = EffectAdapter::new(MissingModule);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(rt.block_on(effects.ensure_loaded()), EffectStatus::LoadFailed);
        let (mut engine, _renderer, clock) = engine_with(effects);
        assert!(engine.bypass_active());

        engine.load_buffer(0, buffer(10.0)).unwrap();
        engine.set_tempo(0, 1.5).unwrap();
        engine.start(0).unwrap();
        clock.advance(2.0);
        engine.stop(0).unwrap();

        let snap = engine.snapshot(0).unwrap();
        assert!(snap.bypass_active);
        assert_eq!(snap.tempo, 1.5);
        assert!((snap.playhead - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_failure_leaves_track_untouched() {
        let (mut engine, _renderer, _clock) = ready_engine();
        assert!(matches!(
            engine.load_encoded(0, vec![1, 2, 3], None, &FailingDecoder),
            Err(EngineError::Decode(_))
        ));
        let snap = engine.snapshot(0).unwrap();
        assert!(!snap.has_buffer);
        assert_eq!(snap.state, TrackState::Idle);

        engine
            .load_encoded(0, vec![128; 2000], Some("raw"), &RawDecoder)
            .unwrap();
        engine.set_segment(0, 0.5, 1.5).unwrap();
        assert!(engine
            .load_encoded(0, vec![], None, &FailingDecoder)
            .is_err());
        assert_eq!(engine.snapshot(0).unwrap().segment, Segment::new(0.5, 1.5));
    }

    #[test]
    fn test_unknown_track_rejected() {
        let (mut engine, _renderer, _clock) = ready_engine();
        assert!(matches!(engine.start(9), Err(EngineError::UnknownTrack(9))));
        assert!(matches!(
            engine.load_encoded(9, vec![], None, &RawDecoder),
            Err(EngineError::UnknownTrack(9))
        ));
        assert!(engine.snapshot(9).is_err());
    }

    #[test]
    fn test_master_gain_reaches_renderer() {
        let (mut engine, mut renderer, _clock) = ready_engine();
        engine.set_master_gain(5.0).unwrap();
        assert_eq!(engine.master_gain(), 2.0);
        assert!(engine.set_master_gain(f32::INFINITY).is_err());

        let mut block = vec![0.0f32; 2 * RATE as usize];
        renderer.process(&mut block);
        assert_eq!(renderer.master_level(), 2.0);
    }
}
