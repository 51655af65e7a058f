//! Audio file loading and decoding

use loopdeck_audio::{DecodeError, DecodedBuffer, Decoder};
use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

/// Track metadata
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    /// Sample rate of the source before resampling
    pub source_sample_rate: u32,
    pub channels: u16,
}

/// A loaded and decoded audio track
pub struct LoadedTrack {
    /// Planar samples at the loader's target rate
    pub buffer: DecodedBuffer,
    pub metadata: TrackMetadata,
}

/// Audio file loader using Symphonia
#[derive(Debug, Clone)]
pub struct TrackLoader {
    target_sample_rate: u32,
}

impl Default for TrackLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackLoader {
    /// Create a new track loader with default 48kHz sample rate
    pub fn new() -> Self {
        Self::with_sample_rate(48000)
    }

    /// Create a new track loader with specific sample rate
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Load and decode an audio file
    pub fn load(&self, path: &Path) -> Result<LoadedTrack, DecodeError> {
        let file = std::fs::File::open(path)?;
        let ext = path.extension().and_then(|e| e.to_str());
        let mut track = self.decode_source(Box::new(file), ext)?;

        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if track.metadata.title.is_empty() {
                track.metadata.title = stem.to_string();
            }
        }
        tracing::info!(
            path = %path.display(),
            duration = track.buffer.duration(),
            "decoded track"
        );
        Ok(track)
    }

    /// Decode an in-memory encoded file. `hint` is a file extension.
    pub fn load_bytes(&self, bytes: Vec<u8>, hint: Option<&str>) -> Result<LoadedTrack, DecodeError> {
        self.decode_source(Box::new(Cursor::new(bytes)), hint)
    }

    fn decode_source(
        &self,
        source: Box<dyn MediaSource>,
        extension: Option<&str>,
    ) -> Result<LoadedTrack, DecodeError> {
        let mss = MediaSourceStream::new(source, Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(map_error)?;

        let mut format = probed.format;

        // Find first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let source_rate = codec_params.sample_rate.ok_or(DecodeError::UnsupportedFormat)?;
        let channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(map_error)?;

        let mut metadata = extract_metadata(&mut format);
        metadata.source_sample_rate = source_rate;
        metadata.channels = channels as u16;

        let mut interleaved: Vec<f32> = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    tracing::debug!("stopping at unreadable packet: {e}");
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping corrupt packet: {e}");
                    continue;
                }
                Err(e) => return Err(map_error(e)),
            };

            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(sample_buf.samples());
        }

        let planar = deinterleave(&interleaved, channels);
        let planar = if source_rate != self.target_sample_rate {
            resample(planar, source_rate, self.target_sample_rate)?
        } else {
            planar
        };

        let buffer = DecodedBuffer::new(planar, self.target_sample_rate)?;
        Ok(LoadedTrack { buffer, metadata })
    }
}

impl Decoder for TrackLoader {
    fn decode(&self, bytes: Vec<u8>, hint: Option<&str>) -> Result<DecodedBuffer, DecodeError> {
        self.load_bytes(bytes, hint).map(|track| track.buffer)
    }
}

fn map_error(e: SymphoniaError) -> DecodeError {
    match e {
        SymphoniaError::IoError(e) => DecodeError::Io(e),
        SymphoniaError::Unsupported(_) => DecodeError::UnsupportedFormat,
        other => DecodeError::Decode(other.to_string()),
    }
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let channels = channels.max(1);
    let frames = samples.len() / channels;
    (0..channels)
        .map(|ch| (0..frames).map(|f| samples[f * channels + ch]).collect())
        .collect()
}

/// Resample planar audio with a fixed-ratio FFT resampler
fn resample(input: Vec<Vec<f32>>, source_rate: u32, target_rate: u32) -> Result<Vec<Vec<f32>>, DecodeError> {
    use rubato::{FftFixedInOut, Resampler};

    let channels = input.len();
    let frames = input.first().map_or(0, |c| c.len());
    if frames == 0 {
        return Ok(input);
    }

    let mut resampler =
        FftFixedInOut::<f32>::new(source_rate as usize, target_rate as usize, 1024, channels)
            .map_err(|e| DecodeError::Decode(e.to_string()))?;

    let chunk_size = resampler.input_frames_next();
    let expected = (frames as u64 * target_rate as u64 / source_rate as u64) as usize;
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected); channels];

    let mut pos = 0;
    while pos < frames {
        let end = (pos + chunk_size).min(frames);
        // Last chunk is zero padded
        let chunk: Vec<Vec<f32>> = input
            .iter()
            .map(|ch| {
                let mut v = ch[pos..end].to_vec();
                v.resize(chunk_size, 0.0);
                v
            })
            .collect();

        let resampled = resampler
            .process(&chunk, None)
            .map_err(|e| DecodeError::Decode(e.to_string()))?;
        for (out, data) in output.iter_mut().zip(resampled) {
            out.extend(data);
        }
        pos = end;
    }

    for out in output.iter_mut() {
        out.truncate(expected);
    }
    Ok(output)
}

fn extract_metadata(format: &mut Box<dyn FormatReader>) -> TrackMetadata {
    let mut metadata = TrackMetadata::default();

    if let Some(meta) = format.metadata().current() {
        for tag in meta.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => metadata.title = tag.value.to_string(),
                Some(StandardTagKey::Artist) => metadata.artist = tag.value.to_string(),
                _ => {}
            }
        }
    }

    metadata
}
