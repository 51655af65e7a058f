//! Audio-thread half of the graph.
//!
//! The renderer owns every source, effect unit and gain stage. It applies
//! pending [`GraphCommand`]s at the top of each block, mixes the sources of
//! each gain node into a bus, and reports sources that ran out. A source
//! playing through an effect unit only ends once the unit has flushed its
//! tail.

use crate::buffer::DecodedBuffer;
use crate::effect::{FrameSource, PitchTempoUnit};
use crate::gain::GainStage;
use crate::graph::{GraphCommand, GraphEvent, NodeId, SourceSpec};
use crossbeam_channel::{Receiver, Sender};
use slotmap::SecondaryMap;
use std::sync::Arc;

/// Maximum buffer size for pre-allocated processing buffers
const MAX_BUFFER_SIZE: usize = 4096;

/// A playing buffer region
struct SourceVoice {
    buffer: Arc<DecodedBuffer>,
    /// Read position in buffer frames
    position: f64,
    start: f64,
    end: f64,
    /// Buffer frames per output frame
    step: f64,
    looping: bool,
    ended: bool,
    effect: Option<NodeId>,
    gain: NodeId,
}

impl SourceVoice {
    fn new(spec: SourceSpec, effect: Option<NodeId>, gain: NodeId, output_rate: u32) -> Self {
        let rate = spec.buffer.sample_rate() as f64;
        let frames = spec.buffer.frames() as f64;
        let end = (spec.region.end * rate).min(frames);
        Self {
            position: spec.offset * rate,
            start: (spec.region.start * rate).min(end),
            end,
            step: rate / output_rate as f64,
            looping: spec.looping,
            ended: false,
            buffer: spec.buffer,
            effect,
            gain,
        }
    }

    /// Render straight to the output, bypassing any effect
    fn render_direct(&mut self, output: &mut [f32]) {
        for frame in output.chunks_exact_mut(2) {
            let (l, r) = self.next_frame().unwrap_or((0.0, 0.0));
            frame[0] = l;
            frame[1] = r;
        }
    }
}

impl FrameSource for SourceVoice {
    fn next_frame(&mut self) -> Option<(f32, f32)> {
        if self.ended {
            return None;
        }
        if self.position >= self.end {
            let len = self.end - self.start;
            if self.looping && len > 0.0 {
                self.position = self.start + (self.position - self.end).rem_euclid(len);
            } else {
                self.ended = true;
                return None;
            }
        }

        // Linear interpolation for non-integer positions
        let last = self.buffer.frames() - 1;
        let idx = (self.position as usize).min(last);
        let frac = (self.position - idx as f64) as f32;
        let (l0, r0) = self.buffer.frame(idx);
        let (l1, r1) = self.buffer.frame((idx + 1).min(last));

        self.position += self.step;
        Some((l0 + frac * (l1 - l0), r0 + frac * (r1 - r0)))
    }
}

/// Audio-thread graph state
pub struct Renderer {
    commands: Receiver<GraphCommand>,
    events: Sender<GraphEvent>,
    sample_rate: u32,
    sources: SecondaryMap<NodeId, SourceVoice>,
    effects: SecondaryMap<NodeId, Box<PitchTempoUnit>>,
    gains: SecondaryMap<NodeId, GainStage>,
    master: GainStage,
    /// Pre-allocated per-source buffer (avoids allocation in audio callback)
    scratch: Vec<f32>,
    /// Pre-allocated per-gain mix
    bus: Vec<f32>,
    finished: Vec<NodeId>,
}

impl Renderer {
    pub fn new(
        commands: Receiver<GraphCommand>,
        events: Sender<GraphEvent>,
        sample_rate: u32,
    ) -> Self {
        Self {
            commands,
            events,
            sample_rate,
            sources: SecondaryMap::new(),
            effects: SecondaryMap::new(),
            gains: SecondaryMap::new(),
            master: GainStage::default(),
            scratch: vec![0.0; MAX_BUFFER_SIZE],
            bus: vec![0.0; MAX_BUFFER_SIZE],
            finished: Vec::with_capacity(16),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sources currently rendering
    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn master_level(&self) -> f32 {
        self.master.level()
    }

    pub fn gain_level(&self, node: NodeId) -> Option<f32> {
        self.gains.get(node).map(GainStage::level)
    }

    /// Effect parameters as seen by the audio thread
    pub fn effect_params(&self, node: NodeId) -> Option<(f32, f32)> {
        self.effects.get(node).map(|u| (u.tempo(), u.semitones()))
    }

    fn ramp_frames(&self, secs: f32) -> u32 {
        (secs.max(0.0) * self.sample_rate as f32).round() as u32
    }

    /// Apply every queued command
    pub fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_command(cmd);
        }
    }

    fn handle_command(&mut self, cmd: GraphCommand) {
        match cmd {
            GraphCommand::CreateGain { node, level } => {
                self.gains.insert(node, GainStage::new(level));
            }
            GraphCommand::CreateEffect { node, unit } => {
                self.effects.insert(node, unit);
            }
            GraphCommand::StartSource {
                node,
                spec,
                effect,
                gain,
            } => {
                if let Some(unit) = effect.and_then(|e| self.effects.get_mut(e)) {
                    unit.reset();
                }
                let voice = SourceVoice::new(spec, effect, gain, self.sample_rate);
                self.sources.insert(node, voice);
            }
            GraphCommand::StopSource { node } => {
                self.sources.remove(node);
            }
            GraphCommand::ReleaseNode { node } => {
                self.effects.remove(node);
                self.gains.remove(node);
            }
            GraphCommand::SetGain {
                node,
                level,
                ramp_secs,
            } => {
                let frames = self.ramp_frames(ramp_secs);
                if let Some(gain) = self.gains.get_mut(node) {
                    gain.ramp_to(level, frames);
                }
            }
            GraphCommand::SetMasterGain { level, ramp_secs } => {
                let frames = self.ramp_frames(ramp_secs);
                self.master.ramp_to(level, frames);
            }
            GraphCommand::SetEffectParams {
                node,
                tempo,
                semitones,
            } => {
                if let Some(unit) = self.effects.get_mut(node) {
                    unit.set_tempo(tempo);
                    unit.set_semitones(semitones);
                }
            }
        }
    }

    /// Render one block of interleaved stereo audio
    pub fn process(&mut self, output: &mut [f32]) {
        self.drain_commands();
        output.fill(0.0);

        let len = output.len();
        if len > self.scratch.len() {
            self.scratch.resize(len, 0.0);
            self.bus.resize(len, 0.0);
        }
        let scratch = &mut self.scratch[..len];
        let bus = &mut self.bus[..len];

        // Every gain stage runs each block so ramps progress while its track is silent
        for (gain_id, gain) in self.gains.iter_mut() {
            bus.fill(0.0);
            for (id, voice) in self.sources.iter_mut().filter(|(_, v)| v.gain == gain_id) {
                if render_voice(voice, &mut self.effects, scratch) {
                    self.finished.push(id);
                }
                for (b, s) in bus.iter_mut().zip(scratch.iter()) {
                    *b += *s;
                }
            }
            gain.process(bus);

            for (out, b) in output.iter_mut().zip(bus.iter()) {
                *out += *b;
            }
        }

        // A source whose gain node is gone is silent but keeps its timeline
        for (id, voice) in self.sources.iter_mut() {
            if self.gains.contains_key(voice.gain) {
                continue;
            }
            if render_voice(voice, &mut self.effects, scratch) {
                self.finished.push(id);
            }
        }

        for id in self.finished.drain(..) {
            self.sources.remove(id);
            let _ = self.events.try_send(GraphEvent::SourceEnded(id));
        }

        self.master.process(output);
    }
}

/// Render one voice into `scratch`. Returns whether the voice is done.
fn render_voice(
    voice: &mut SourceVoice,
    effects: &mut SecondaryMap<NodeId, Box<PitchTempoUnit>>,
    scratch: &mut [f32],
) -> bool {
    match voice.effect.and_then(|e| effects.get_mut(e)) {
        Some(unit) => {
            unit.render(voice, scratch);
            voice.ended && unit.is_drained()
        }
        None => {
            voice.render_direct(scratch);
            voice.ended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{FftSize, StretchModule};
    use crate::graph::{GraphManager, NodeKind};
    use crate::segment::Segment;
    use crossbeam_channel::bounded;

    const RATE: u32 = 1000;

    struct Rig {
        graph: GraphManager,
        renderer: Renderer,
        events: Receiver<GraphEvent>,
    }

    fn rig() -> Rig {
        let (cmd_tx, cmd_rx) = bounded(64);
        let (evt_tx, evt_rx) = bounded(64);
        Rig {
            graph: GraphManager::new(cmd_tx),
            renderer: Renderer::new(cmd_rx, evt_tx, RATE),
            events: evt_rx,
        }
    }

    /// One second ramp from 0.0 to ~1.0 at RATE
    fn ramp_buffer() -> Arc<DecodedBuffer> {
        let samples = (0..RATE).map(|i| i as f32 / RATE as f32).collect();
        Arc::new(DecodedBuffer::new(vec![samples], RATE).unwrap())
    }

    fn spec(offset: f64, region: Segment, looping: bool) -> SourceSpec {
        SourceSpec {
            buffer: ramp_buffer(),
            offset,
            region,
            looping,
        }
    }

    #[test]
    fn test_one_shot_source_ends_once() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        let src = rig
            .graph
            .create_source(spec(0.5, Segment::new(0.5, 0.6), false), None, gain)
            .unwrap();

        let mut out = vec![0.0f32; 512];
        rig.renderer.process(&mut out);
        // First frame is the buffer value at 0.5s
        assert!((out[0] - 0.5).abs() < 1e-6);
        // 100 frames played, the rest is silence
        assert_eq!(out[2 * 100], 0.0);

        assert_eq!(rig.events.try_recv(), Ok(GraphEvent::SourceEnded(src)));
        rig.renderer.process(&mut out);
        assert!(rig.events.try_recv().is_err());
        assert_eq!(rig.renderer.active_sources(), 0);
    }

    #[test]
    fn test_looping_source_wraps_and_never_ends() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        rig.graph
            .create_source(spec(0.2, Segment::new(0.2, 0.3), true), None, gain)
            .unwrap();

        let mut out = vec![0.0f32; 2 * 250];
        rig.renderer.process(&mut out);
        // Frame 100 wraps back to 0.2s
        assert!((out[2 * 100] - 0.2).abs() < 1e-6);
        assert!(out.iter().all(|s| *s >= 0.2 - 1e-6 && *s < 0.3));
        assert!(rig.events.try_recv().is_err());
        assert_eq!(rig.renderer.active_sources(), 1);
    }

    #[test]
    fn test_stop_source_silences() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        let src = rig
            .graph
            .create_source(spec(0.5, Segment::new(0.0, 1.0), false), None, gain)
            .unwrap();
        assert_eq!(rig.graph.teardown_source(src), Ok(true));

        let mut out = vec![1.0f32; 64];
        rig.renderer.process(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(rig.events.try_recv().is_err());
    }

    #[test]
    fn test_gain_and_master_ramps() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        rig.graph.set_gain(gain, 0.5, 0.05).unwrap();
        rig.graph.set_master_gain(0.0, 0.0).unwrap();

        let mut out = vec![0.0f32; 2 * 30];
        rig.renderer.process(&mut out);
        // 50 ms at 1 kHz is 50 frames, so the ramp is partway after 30
        assert_eq!(rig.renderer.master_level(), 0.0);
        let level = rig.renderer.gain_level(gain).unwrap();
        assert!(level < 1.0 && level > 0.5, "level {level}");

        rig.graph
            .create_source(spec(0.0, Segment::new(0.0, 1.0), true), None, gain)
            .unwrap();
        rig.renderer.process(&mut out);
        assert_eq!(rig.renderer.gain_level(gain), Some(0.5));
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_idle_gain_ramp_completes() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        rig.graph.set_gain(gain, 0.25, 0.05).unwrap();

        let mut out = vec![0.0f32; 2 * 100];
        rig.renderer.process(&mut out);
        assert_eq!(rig.renderer.gain_level(gain), Some(0.25));

        // A source started afterwards plays at the new level from its first frame
        rig.graph
            .create_source(spec(0.5, Segment::new(0.0, 1.0), true), None, gain)
            .unwrap();
        rig.renderer.process(&mut out);
        assert!((out[0] - 0.5 * 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_source_through_effect() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        let module = Arc::new(StretchModule::new(FftSize::Small));
        let effect = rig.graph.create_effect(module.instantiate()).unwrap();
        rig.graph.set_effect_params(effect, 2.0, 3.0).unwrap();
        rig.graph
            .create_source(spec(0.0, Segment::new(0.0, 1.0), true), Some(effect), gain)
            .unwrap();

        let mut out = vec![0.0f32; 2 * 512];
        rig.renderer.process(&mut out);
        assert!(out.iter().all(|s| s.is_finite()));
        assert_eq!(rig.renderer.effect_params(effect), Some((2.0, 3.0)));
        assert!(rig.graph.is_live(effect, NodeKind::Effect));
    }

    /// Sum of squares of the left channel, and the output frame count at which
    /// the source reported its end
    fn play_one_shot(through_effect: bool) -> (f64, Option<usize>) {
        const OUT_RATE: u32 = 48000;
        let (cmd_tx, cmd_rx) = bounded(64);
        let (evt_tx, evt_rx) = bounded(64);
        let mut graph = GraphManager::new(cmd_tx);
        let mut renderer = Renderer::new(cmd_rx, evt_tx, OUT_RATE);

        let samples = (0..OUT_RATE)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / OUT_RATE as f32).sin() * 0.5)
            .collect();
        let buffer = Arc::new(DecodedBuffer::new(vec![samples], OUT_RATE).unwrap());
        let gain = graph.create_gain(1.0).unwrap();
        let effect = through_effect.then(|| {
            let module = Arc::new(StretchModule::new(FftSize::Medium));
            graph.create_effect(module.instantiate()).unwrap()
        });
        let source = graph
            .create_source(
                SourceSpec {
                    buffer,
                    offset: 0.0,
                    region: Segment::new(0.0, 0.5),
                    looping: false,
                },
                effect,
                gain,
            )
            .unwrap();

        let mut energy = 0.0f64;
        let mut ended_at = None;
        let mut block = vec![0.0f32; 2 * 512];
        let mut rendered = 0;
        while rendered < OUT_RATE as usize * 2 {
            renderer.process(&mut block);
            rendered += 512;
            energy += block.iter().step_by(2).map(|s| (*s as f64).powi(2)).sum::<f64>();
            if ended_at.is_none() && evt_rx.try_recv() == Ok(GraphEvent::SourceEnded(source)) {
                ended_at = Some(rendered);
            }
        }
        (energy, ended_at)
    }

    #[test]
    fn test_effect_path_plays_whole_region() {
        let region_frames = 24000;
        let (direct, direct_end) = play_one_shot(false);
        let (effect, effect_end) = play_one_shot(true);

        assert!(direct_end.is_some_and(|f| f >= region_frames));
        // The unit's tail is played out before the source reports its end
        assert!(effect_end.is_some_and(|f| f >= region_frames), "{effect_end:?}");
        let ratio = effect / direct;
        assert!((0.95..1.05).contains(&ratio), "energy ratio {ratio}");
    }

    #[test]
    fn test_released_gain_mutes_source() {
        let mut rig = rig();
        let gain = rig.graph.create_gain(1.0).unwrap();
        rig.graph
            .create_source(spec(0.5, Segment::new(0.0, 1.0), true), None, gain)
            .unwrap();
        rig.graph.release_node(gain);

        let mut out = vec![1.0f32; 64];
        rig.renderer.process(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_resampled_source_steps_at_rate_ratio() {
        let (cmd_tx, cmd_rx) = bounded(16);
        let (evt_tx, _evt_rx) = bounded(16);
        let mut graph = GraphManager::new(cmd_tx);
        // Output at twice the buffer rate: each buffer frame lasts two output frames
        let mut renderer = Renderer::new(cmd_rx, evt_tx, RATE * 2);
        let gain = graph.create_gain(1.0).unwrap();
        graph
            .create_source(spec(0.0, Segment::new(0.0, 1.0), false), None, gain)
            .unwrap();

        let mut out = vec![0.0f32; 2 * 4];
        renderer.process(&mut out);
        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert!((left[2] - 1.0 / RATE as f32).abs() < 1e-6);
        assert!((left[1] - 0.5 / RATE as f32).abs() < 1e-6);
    }
}
