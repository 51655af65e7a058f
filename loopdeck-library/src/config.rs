//! Simple configuration persistence for loopdeck
//!
//! Stores engine settings and the last folder a track was loaded from.

use loopdeck_audio::{EngineConfig, FftSize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    pub engine: EngineConfig,
    /// Folder the last track was loaded from
    pub last_folder: Option<PathBuf>,
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "could not read config: {e}");
                }
                Self::default()
            }
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Save config to the default location
    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path();
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("loopdeck")
            .join("config.txt")
    }

    /// Parse config from simple key=value format
    fn parse(content: &str) -> Self {
        let mut config = Self::default();
        let engine = &mut config.engine;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "track_count" => set_parsed(&mut engine.track_count, value, |n| *n > 0),
                "marker_tolerance_px" => {
                    set_parsed(&mut engine.marker_tolerance_px, value, |v| *v >= 0.0)
                }
                "min_segment_secs" => set_parsed(&mut engine.min_segment_secs, value, |v| *v > 0.0),
                "gain_ramp_secs" => set_parsed(&mut engine.gain_ramp_secs, value, |v| *v >= 0.0),
                "command_queue" => set_parsed(&mut engine.command_queue, value, |n| *n > 0),
                "fft_size" => {
                    if let Some(size) = value.parse().ok().and_then(FftSize::from_usize) {
                        engine.fft_size = size;
                    }
                }
                "last_folder" => {
                    if !value.is_empty() {
                        config.last_folder = Some(PathBuf::from(value));
                    }
                }
                _ => {} // Ignore unknown keys
            }
        }

        config
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let engine = &self.engine;
        let mut lines = vec![
            "# loopdeck configuration".to_string(),
            format!("track_count={}", engine.track_count),
            format!("marker_tolerance_px={}", engine.marker_tolerance_px),
            format!("min_segment_secs={}", engine.min_segment_secs),
            format!("gain_ramp_secs={}", engine.gain_ramp_secs),
            format!("fft_size={}", engine.fft_size.as_usize()),
            format!("command_queue={}", engine.command_queue),
        ];

        if let Some(ref folder) = self.last_folder {
            lines.push(format!("last_folder={}", folder.display()));
        }

        lines.join("\n")
    }
}

/// Overwrite `slot` when `value` parses and passes `valid`
fn set_parsed<T: FromStr>(slot: &mut T, value: &str, valid: impl Fn(&T) -> bool) {
    match value.parse::<T>() {
        Ok(v) if valid(&v) => *slot = v,
        _ => tracing::warn!("ignoring bad config value {value:?}"),
    }
}
