//! Decoded audio consumed by tracks

use crate::error::DecodeError;

/// Immutable decoded audio, one sample vector per channel
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl DecodedBuffer {
    /// Build a buffer from planar channel data.
    ///
    /// All channels must have the same length, there must be at least one
    /// channel, and the sample rate must be non-zero.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, DecodeError> {
        if channels.is_empty() {
            return Err(DecodeError::NoAudioTrack);
        }
        if sample_rate == 0 {
            return Err(DecodeError::Decode("sample rate is zero".into()));
        }
        let frames = channels[0].len();
        if channels.iter().any(|ch| ch.len() != frames) {
            return Err(DecodeError::Decode("channel lengths differ".into()));
        }
        if frames == 0 {
            return Err(DecodeError::Empty);
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Build a buffer from interleaved samples
    pub fn from_interleaved(
        samples: &[f32],
        channel_count: usize,
        sample_rate: u32,
    ) -> Result<Self, DecodeError> {
        if channel_count == 0 {
            return Err(DecodeError::NoAudioTrack);
        }
        let frames = samples.len() / channel_count;
        let channels = (0..channel_count)
            .map(|ch| (0..frames).map(|f| samples[f * channel_count + ch]).collect())
            .collect();
        Self::new(channels, sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Stereo frame at `index`. Mono is duplicated to both sides.
    #[inline]
    pub fn frame(&self, index: usize) -> (f32, f32) {
        let left = self.channels[0][index];
        let right = match self.channels.get(1) {
            Some(ch) => ch[index],
            None => left,
        };
        (left, right)
    }
}

/// Turns encoded bytes into a [`DecodedBuffer`]
pub trait Decoder {
    /// `hint` is an optional file extension used to pick the container
    fn decode(&self, bytes: Vec<u8>, hint: Option<&str>) -> Result<DecodedBuffer, DecodeError>;
}
