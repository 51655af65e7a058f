//! Playback core for loopdeck - tracks, loop segments, graph and effects
//!
//! This crate provides the multi-track loop playback pipeline:
//! - Track: per-track playback state machine with loop regions
//! - Segment: loop boundaries and marker drag editing
//! - Graph: control-side node ids and commands, rendered by the `Renderer`
//! - Effect: shared pitch/tempo module with a one-shot async load
//! - Transport: play all / stop all across tracks

mod buffer;
mod clock;
pub mod effect;
mod engine;
mod error;
mod gain;
mod graph;
mod render;
mod segment;
mod track;
mod transport;

pub use buffer::{DecodedBuffer, Decoder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use effect::{EffectAdapter, EffectLoadError, EffectStatus, FftSize, ModuleLoader, PitchTempoUnit};
pub use engine::{Engine, EngineConfig};
pub use error::{DecodeError, EngineError, Result};
pub use gain::GainStage;
pub use graph::{GraphCommand, GraphError, GraphEvent, GraphManager, NodeId, NodeKind, SourceSpec};
pub use render::Renderer;
pub use segment::{DragState, Marker, Segment, SegmentModel};
pub use track::{Track, TrackContext, TrackId, TrackSnapshot, TrackState};
pub use transport::{toggle_all, TransportState};
