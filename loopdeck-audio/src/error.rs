//! Error types for the playback core

use crate::graph::GraphError;
use crate::track::TrackId;
use thiserror::Error;

/// Errors that can occur while decoding audio
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found")]
    NoAudioTrack,
    #[error("Unsupported format")]
    UnsupportedFormat,
    #[error("Decoded audio is empty")]
    Empty,
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown track {0}")]
    UnknownTrack(TrackId),
    #[error("Track {0} has no audio loaded")]
    NotLoaded(TrackId),
    #[error("Failed to decode audio: {0}")]
    Decode(#[from] DecodeError),
    #[error("Invalid segment [{start:.3}, {end:.3}]")]
    InvalidSegment { start: f64, end: f64 },
    #[error("Invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
