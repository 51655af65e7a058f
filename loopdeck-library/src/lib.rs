//! Track loading and settings for loopdeck

mod config;
mod loader;

pub use config::Config;
pub use loader::{LoadedTrack, TrackLoader, TrackMetadata};
