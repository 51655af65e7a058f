//! Control-side audio graph: node identity and queued commands.
//!
//! Each track routes `source -> [effect] -> track gain -> master -> output`.
//! The control thread allocates node ids from a generational slot table and
//! sends commands to the [`Renderer`](crate::Renderer), which owns the
//! actual DSP state. A torn-down source id is never handed out again, so a
//! completion event naming it can always be recognised as stale.

use crate::buffer::DecodedBuffer;
use crate::effect::PitchTempoUnit;
use crate::segment::Segment;
use crossbeam_channel::{Sender, TrySendError};
use slotmap::SlotMap;
use std::sync::Arc;
use thiserror::Error;

slotmap::new_key_type! {
    /// Generational handle to a graph node
    pub struct NodeId;
}

/// What a node id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Effect,
    Gain,
}

/// Errors that can occur while mutating the graph
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Audio command queue is full")]
    QueueFull,
    #[error("Audio thread is not running")]
    Disconnected,
    #[error("Cannot start source at {offset:.3}s in [{start:.3}, {end:.3}]")]
    InvalidRegion { offset: f64, start: f64, end: f64 },
}

/// Everything the renderer needs to play one source
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub buffer: Arc<DecodedBuffer>,
    /// Start position in seconds
    pub offset: f64,
    /// Wrap bounds when looping, otherwise `region.end` is the stop point
    pub region: Segment,
    pub looping: bool,
}

/// Commands consumed by the audio thread
#[derive(Debug)]
pub enum GraphCommand {
    CreateGain {
        node: NodeId,
        level: f32,
    },
    CreateEffect {
        node: NodeId,
        unit: Box<PitchTempoUnit>,
    },
    StartSource {
        node: NodeId,
        spec: SourceSpec,
        effect: Option<NodeId>,
        gain: NodeId,
    },
    StopSource {
        node: NodeId,
    },
    /// Drop an effect or gain node
    ReleaseNode {
        node: NodeId,
    },
    SetGain {
        node: NodeId,
        level: f32,
        ramp_secs: f32,
    },
    SetMasterGain {
        level: f32,
        ramp_secs: f32,
    },
    SetEffectParams {
        node: NodeId,
        tempo: f32,
        semitones: f32,
    },
}

/// Notifications sent back from the audio thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEvent {
    /// A non-looping source reached its stop point
    SourceEnded(NodeId),
}

/// Allocates node ids and issues graph commands
pub struct GraphManager {
    commands: Sender<GraphCommand>,
    nodes: SlotMap<NodeId, NodeKind>,
    master_level: f32,
}

impl GraphManager {
    pub fn new(commands: Sender<GraphCommand>) -> Self {
        Self {
            commands,
            nodes: SlotMap::with_key(),
            master_level: 1.0,
        }
    }

    fn send(&self, cmd: GraphCommand) -> Result<(), GraphError> {
        self.commands.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => GraphError::QueueFull,
            TrySendError::Disconnected(_) => GraphError::Disconnected,
        })
    }

    /// Allocate a node and send its creation command, rolling back on failure
    fn create(
        &mut self,
        kind: NodeKind,
        build: impl FnOnce(NodeId) -> GraphCommand,
    ) -> Result<NodeId, GraphError> {
        let node = self.nodes.insert(kind);
        if let Err(e) = self.send(build(node)) {
            self.nodes.remove(node);
            return Err(e);
        }
        Ok(node)
    }

    /// Start a fresh one-shot source. Sources are never reused.
    pub fn create_source(
        &mut self,
        spec: SourceSpec,
        effect: Option<NodeId>,
        gain: NodeId,
    ) -> Result<NodeId, GraphError> {
        let region = spec.region;
        let valid = spec.offset.is_finite()
            && region.start >= 0.0
            && region.start < region.end
            && region.end <= spec.buffer.duration() + 1e-9
            && spec.offset >= region.start
            && spec.offset < region.end;
        if !valid {
            return Err(GraphError::InvalidRegion {
                offset: spec.offset,
                start: region.start,
                end: region.end,
            });
        }

        self.create(NodeKind::Source, |node| GraphCommand::StartSource {
            node,
            spec,
            effect,
            gain,
        })
    }

    pub fn create_effect(&mut self, unit: PitchTempoUnit) -> Result<NodeId, GraphError> {
        let unit = Box::new(unit);
        self.create(NodeKind::Effect, |node| GraphCommand::CreateEffect { node, unit })
    }

    pub fn create_gain(&mut self, level: f32) -> Result<NodeId, GraphError> {
        self.create(NodeKind::Gain, |node| GraphCommand::CreateGain { node, level })
    }

    /// Stop and forget a source. Returns false if it was already gone.
    ///
    /// The id stays live until the renderer has been told to stop it, so a
    /// failed teardown can be retried.
    pub fn teardown_source(&mut self, node: NodeId) -> Result<bool, GraphError> {
        if self.nodes.get(node) != Some(&NodeKind::Source) {
            return Ok(false);
        }
        self.send(GraphCommand::StopSource { node })?;
        self.nodes.remove(node);
        Ok(true)
    }

    /// Forget a source the renderer already removed on its own
    pub fn forget_source(&mut self, node: NodeId) -> bool {
        if self.nodes.get(node) != Some(&NodeKind::Source) {
            return false;
        }
        self.nodes.remove(node);
        true
    }

    /// Drop an effect or gain node. Returns false if it was already gone.
    pub fn release_node(&mut self, node: NodeId) -> bool {
        match self.nodes.get(node) {
            Some(NodeKind::Effect) | Some(NodeKind::Gain) => {}
            _ => return false,
        }
        self.nodes.remove(node);
        if let Err(e) = self.send(GraphCommand::ReleaseNode { node }) {
            tracing::warn!("node release not delivered: {e}");
        }
        true
    }

    /// Ramp a track gain node to `level`
    pub fn set_gain(&self, node: NodeId, level: f32, ramp_secs: f32) -> Result<(), GraphError> {
        self.send(GraphCommand::SetGain {
            node,
            level,
            ramp_secs,
        })
    }

    pub fn set_master_gain(&mut self, level: f32, ramp_secs: f32) -> Result<(), GraphError> {
        self.send(GraphCommand::SetMasterGain { level, ramp_secs })?;
        self.master_level = level;
        Ok(())
    }

    pub fn master_level(&self) -> f32 {
        self.master_level
    }

    pub fn set_effect_params(
        &self,
        node: NodeId,
        tempo: f32,
        semitones: f32,
    ) -> Result<(), GraphError> {
        self.send(GraphCommand::SetEffectParams {
            node,
            tempo,
            semitones,
        })
    }

    /// Whether `node` is a live node of the given kind
    pub fn is_live(&self, node: NodeId, kind: NodeKind) -> bool {
        self.nodes.get(node) == Some(&kind)
    }

    pub fn live_count(&self, kind: NodeKind) -> usize {
        self.nodes.values().filter(|k| **k == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver};

    fn manager(capacity: usize) -> (GraphManager, Receiver<GraphCommand>) {
        let (tx, rx) = bounded(capacity);
        (GraphManager::new(tx), rx)
    }

    fn spec(offset: f64, start: f64, end: f64) -> SourceSpec {
        let buffer = DecodedBuffer::new(vec![vec![0.0; 1000]], 100).unwrap();
        SourceSpec {
            buffer: Arc::new(buffer),
            offset,
            region: Segment::new(start, end),
            looping: false,
        }
    }

    #[test]
    fn test_sources_get_distinct_ids() {
        let (mut graph, _rx) = manager(16);
        let gain = graph.create_gain(1.0).unwrap();
        let a = graph.create_source(spec(0.0, 0.0, 10.0), None, gain).unwrap();
        assert_eq!(graph.teardown_source(a), Ok(true));
        let b = graph.create_source(spec(0.0, 0.0, 10.0), None, gain).unwrap();
        assert_ne!(a, b);
        assert!(!graph.is_live(a, NodeKind::Source));
        assert!(graph.is_live(b, NodeKind::Source));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (mut graph, rx) = manager(16);
        let gain = graph.create_gain(1.0).unwrap();
        let src = graph.create_source(spec(1.0, 0.0, 10.0), None, gain).unwrap();
        assert_eq!(graph.teardown_source(src), Ok(true));
        assert_eq!(graph.teardown_source(src), Ok(false));

        let stops = rx
            .try_iter()
            .filter(|c| matches!(c, GraphCommand::StopSource { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_teardown_rejects_other_kinds() {
        let (mut graph, _rx) = manager(16);
        let gain = graph.create_gain(1.0).unwrap();
        assert_eq!(graph.teardown_source(gain), Ok(false));
        assert!(graph.is_live(gain, NodeKind::Gain));
        assert!(graph.release_node(gain));
        assert!(!graph.release_node(gain));
    }

    #[test]
    fn test_invalid_region_rejected() {
        let (mut graph, _rx) = manager(16);
        let gain = graph.create_gain(1.0).unwrap();
        for s in [
            spec(10.0, 0.0, 10.0),
            spec(-1.0, 0.0, 10.0),
            spec(5.0, 6.0, 6.0),
            spec(1.0, 0.0, 11.0),
            spec(f64::NAN, 0.0, 10.0),
        ] {
            assert!(matches!(
                graph.create_source(s, None, gain),
                Err(GraphError::InvalidRegion { .. })
            ));
        }
        assert_eq!(graph.live_count(NodeKind::Source), 0);
    }

    #[test]
    fn test_full_queue_rolls_back() {
        let (mut graph, _rx) = manager(1);
        let gain = graph.create_gain(1.0).unwrap();
        let result = graph.create_source(spec(0.0, 0.0, 10.0), None, gain);
        assert_eq!(result, Err(GraphError::QueueFull));
        assert_eq!(graph.live_count(NodeKind::Source), 0);
    }

    #[test]
    fn test_undelivered_teardown_keeps_source_live() {
        let (mut graph, rx) = manager(2);
        let gain = graph.create_gain(1.0).unwrap();
        let src = graph.create_source(spec(0.0, 0.0, 10.0), None, gain).unwrap();

        assert_eq!(graph.teardown_source(src), Err(GraphError::QueueFull));
        assert!(graph.is_live(src, NodeKind::Source));

        // Once the audio thread catches up the retry goes through
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(graph.teardown_source(src), Ok(true));
        assert!(!graph.is_live(src, NodeKind::Source));
    }

    #[test]
    fn test_master_level_tracks_delivered_value() {
        let (mut graph, rx) = manager(1);
        graph.set_master_gain(0.5, 0.0).unwrap();
        assert_eq!(graph.set_master_gain(0.2, 0.0), Err(GraphError::QueueFull));
        assert_eq!(graph.master_level(), 0.5);

        drop(rx);
        assert_eq!(graph.set_master_gain(0.8, 0.0), Err(GraphError::Disconnected));
        assert_eq!(graph.master_level(), 0.5);
    }

    #[test]
    fn test_disconnected_reported() {
        let (mut graph, rx) = manager(4);
        drop(rx);
        assert_eq!(graph.create_gain(1.0), Err(GraphError::Disconnected));
        assert_eq!(graph.live_count(NodeKind::Gain), 0);
    }
}
