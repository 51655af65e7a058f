//! Phase vocoder pitch/tempo unit.
//!
//! The unit pulls stereo frames from a [`FrameSource`] at `tempo` input
//! frames per output frame and shifts pitch by `2^(semitones / 12)`:
//!
//! 1. STFT analysis with a Hann window and 75% overlap
//! 2. Phase propagation so the vocoder stretches time by `pitch_ratio / tempo`
//! 3. Overlap-add resynthesis
//! 4. Linear-interpolating resampler reading the vocoder output at
//!    `pitch_ratio`, which restores the duration and moves the pitch
//!
//! The FFT plans and window are immutable and shared by every unit through
//! [`StretchModule`], so instantiating a unit per track is cheap.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

const TWO_PI: f32 = 2.0 * PI;

/// Sum of squared Hann windows at 75% overlap
const HANN_OLA_GAIN: f32 = 1.5;

/// Accepted tempo range (1.0 = original speed)
pub const TEMPO_RANGE: (f32, f32) = (0.25, 4.0);

/// Accepted pitch range in semitones
pub const PITCH_RANGE: (f32, f32) = (-12.0, 12.0);

/// FFT size options for the vocoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FftSize {
    /// 1024 samples - lower latency, less frequency resolution
    Small = 1024,
    /// 2048 samples - balanced
    #[default]
    Medium = 2048,
    /// 4096 samples - higher quality, more latency
    Large = 4096,
}

impl FftSize {
    #[inline]
    pub fn as_usize(self) -> usize {
        self as usize
    }

    /// Synthesis hop (75% overlap)
    #[inline]
    pub fn hop_size(self) -> usize {
        self.as_usize() / 4
    }

    pub fn from_usize(size: usize) -> Option<Self> {
        match size {
            1024 => Some(FftSize::Small),
            2048 => Some(FftSize::Medium),
            4096 => Some(FftSize::Large),
            _ => None,
        }
    }
}

/// Pull-based stereo input for the unit
pub trait FrameSource {
    /// Next stereo frame, or `None` once the source is exhausted
    fn next_frame(&mut self) -> Option<(f32, f32)>;
}

/// Shared FFT plans and window, built once per engine
pub struct StretchModule {
    size: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl fmt::Debug for StretchModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StretchModule")
            .field("size", &self.size)
            .field("hop", &self.hop)
            .finish()
    }
}

impl StretchModule {
    pub fn new(fft_size: FftSize) -> Self {
        let size = fft_size.as_usize();
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);

        // Periodic Hann
        let window = (0..size)
            .map(|i| 0.5 - 0.5 * (TWO_PI * i as f32 / size as f32).cos())
            .collect();

        Self {
            size,
            hop: fft_size.hop_size(),
            window,
            forward,
            inverse,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.size
    }

    /// Create a per-track unit sharing this module's plans
    pub fn instantiate(self: &Arc<Self>) -> PitchTempoUnit {
        PitchTempoUnit::new(Arc::clone(self))
    }
}

/// Per-channel vocoder state
struct Channel {
    input: Vec<f32>,
    overlap: Vec<f32>,
    prev_phase: Vec<f32>,
    synth_phase: Vec<f32>,
}

impl Channel {
    fn new(size: usize) -> Self {
        let bins = size / 2 + 1;
        Self {
            input: vec![0.0; size],
            overlap: vec![0.0; size],
            prev_phase: vec![0.0; bins],
            synth_phase: vec![0.0; bins],
        }
    }

    fn reset(&mut self) {
        self.input.fill(0.0);
        self.overlap.fill(0.0);
        self.prev_phase.fill(0.0);
        self.synth_phase.fill(0.0);
    }
}

/// Time-stretch and pitch-shift processor for one track
pub struct PitchTempoUnit {
    module: Arc<StretchModule>,
    tempo: f32,
    semitones: f32,
    left: Channel,
    right: Channel,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Vocoder output waiting for the resampler
    pending: VecDeque<(f32, f32)>,
    /// Fractional read position into `pending`
    read_pos: f64,
    /// Fractional part of the analysis hop carried to the next frame
    hop_carry: f64,
    first_frame: bool,
    /// The source has run dry
    input_done: bool,
    /// Zero frames pulled since the source ran dry
    padding: usize,
    /// Synthesis hops left before the last real input is in `pending`
    flush_hops: usize,
}

impl fmt::Debug for PitchTempoUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PitchTempoUnit")
            .field("tempo", &self.tempo)
            .field("semitones", &self.semitones)
            .finish()
    }
}

impl PitchTempoUnit {
    fn new(module: Arc<StretchModule>) -> Self {
        let size = module.size;
        let scratch_len = module
            .forward
            .get_inplace_scratch_len()
            .max(module.inverse.get_inplace_scratch_len());
        Self {
            tempo: 1.0,
            semitones: 0.0,
            left: Channel::new(size),
            right: Channel::new(size),
            spectrum: vec![Complex::default(); size],
            scratch: vec![Complex::default(); scratch_len],
            pending: VecDeque::with_capacity(size * 4),
            read_pos: 0.0,
            hop_carry: 0.0,
            first_frame: true,
            input_done: false,
            padding: 0,
            flush_hops: 0,
            module,
        }
    }

    pub fn set_tempo(&mut self, tempo: f32) {
        self.tempo = tempo.clamp(TEMPO_RANGE.0, TEMPO_RANGE.1);
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn set_semitones(&mut self, semitones: f32) {
        self.semitones = semitones.clamp(PITCH_RANGE.0, PITCH_RANGE.1);
    }

    pub fn semitones(&self) -> f32 {
        self.semitones
    }

    #[inline]
    fn pitch_ratio(&self) -> f32 {
        2.0f32.powf(self.semitones / 12.0)
    }

    /// Input frames per analysis frame, before rounding
    fn analysis_hop(&self) -> f64 {
        self.module.hop as f64 * self.tempo as f64 / self.pitch_ratio() as f64
    }

    /// Whole input frames for the next analysis frame. The remainder carries
    /// over so the long-run input rate is exactly `tempo`.
    fn next_analysis_hop(&mut self) -> usize {
        self.hop_carry += self.analysis_hop();
        let hop = (self.hop_carry as usize).max(1);
        self.hop_carry -= hop as f64;
        hop
    }

    /// Every real input frame has been synthesized
    fn is_flushed(&self) -> bool {
        self.input_done && self.flush_hops == 0
    }

    /// The source ran dry and all of its audio has been rendered
    pub fn is_drained(&self) -> bool {
        self.is_flushed() && self.pending.len() < self.read_pos as usize + 2
    }

    /// Drop all buffered audio and phase history
    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.pending.clear();
        self.read_pos = 0.0;
        self.hop_carry = 0.0;
        self.first_frame = true;
        self.input_done = false;
        self.padding = 0;
        self.flush_hops = 0;
    }

    /// Render interleaved stereo into `output`, pulling from `source`
    pub fn render(&mut self, source: &mut dyn FrameSource, output: &mut [f32]) {
        let ratio = self.pitch_ratio() as f64;

        for frame in output.chunks_exact_mut(2) {
            while self.pending.len() < self.read_pos as usize + 2 && !self.is_flushed() {
                self.advance(source);
            }
            if self.is_drained() {
                frame[0] = 0.0;
                frame[1] = 0.0;
                continue;
            }

            let idx = self.read_pos as usize;
            let frac = (self.read_pos - idx as f64) as f32;
            let (l0, r0) = self.pending[idx];
            let (l1, r1) = self.pending[idx + 1];
            frame[0] = l0 + frac * (l1 - l0);
            frame[1] = r0 + frac * (r1 - r0);

            self.read_pos += ratio;
            let consumed = self.read_pos as usize;
            if consumed > 0 {
                self.pending.drain(..consumed);
                self.read_pos -= consumed as f64;
            }
        }
    }

    /// Pull one analysis hop of input and push one synthesis hop of output
    fn advance(&mut self, source: &mut dyn FrameSource) {
        let size = self.module.size;
        let hop_out = self.module.hop;
        let hop_in = self.next_analysis_hop();
        let mut missing = 0;

        if hop_in >= size {
            for _ in 0..hop_in - size {
                if source.next_frame().is_none() {
                    missing += 1;
                }
            }
        } else {
            self.left.input.copy_within(hop_in.., 0);
            self.right.input.copy_within(hop_in.., 0);
        }

        let fill_from = size.saturating_sub(hop_in);
        for i in fill_from..size {
            let (l, r) = source.next_frame().unwrap_or_else(|| {
                missing += 1;
                (0.0, 0.0)
            });
            self.left.input[i] = l;
            self.right.input[i] = r;
        }

        if missing > 0 && !self.input_done {
            self.input_done = true;
            self.flush_hops = size / hop_out;
        }
        self.padding += missing;

        let first = self.first_frame;
        self.first_frame = false;
        for channel in [&mut self.left, &mut self.right] {
            vocode(
                &self.module,
                channel,
                &mut self.spectrum,
                &mut self.scratch,
                hop_in,
                first,
            );
        }

        for i in 0..hop_out {
            self.pending
                .push_back((self.left.overlap[i], self.right.overlap[i]));
        }
        for channel in [&mut self.left, &mut self.right] {
            channel.overlap.copy_within(hop_out.., 0);
            channel.overlap[size - hop_out..].fill(0.0);
        }

        // Once the window holds only padding, the overlap still owes one window of output
        if self.input_done && self.padding >= size {
            self.flush_hops = self.flush_hops.saturating_sub(1);
        }
    }
}

/// Analyze `channel.input`, propagate phases and overlap-add the result
fn vocode(
    module: &StretchModule,
    channel: &mut Channel,
    spectrum: &mut [Complex<f32>],
    scratch: &mut [Complex<f32>],
    hop_in: usize,
    first: bool,
) {
    let size = module.size;
    let hop_out = module.hop as f32;
    let hop_in_f = hop_in as f32;

    for (bin, (&x, &w)) in spectrum
        .iter_mut()
        .zip(channel.input.iter().zip(module.window.iter()))
    {
        *bin = Complex::new(x * w, 0.0);
    }
    module.forward.process_with_scratch(spectrum, scratch);

    let half = size / 2;
    for k in 0..=half {
        let (mag, phase) = spectrum[k].to_polar();
        let omega = TWO_PI * k as f32 / size as f32;

        let synth = if first {
            phase
        } else {
            let deviation = wrap_phase(phase - channel.prev_phase[k] - omega * hop_in_f);
            let true_freq = omega + deviation / hop_in_f;
            wrap_phase(channel.synth_phase[k] + true_freq * hop_out)
        };
        channel.prev_phase[k] = phase;
        channel.synth_phase[k] = synth;
        spectrum[k] = Complex::from_polar(mag, synth);
    }
    for k in 1..half {
        spectrum[size - k] = spectrum[k].conj();
    }

    module.inverse.process_with_scratch(spectrum, scratch);

    let norm = 1.0 / (size as f32 * HANN_OLA_GAIN);
    for ((acc, bin), &w) in channel
        .overlap
        .iter_mut()
        .zip(spectrum.iter())
        .zip(module.window.iter())
    {
        *acc += bin.re * w * norm;
    }
}

/// Wrap phase to [-π, π)
#[inline(always)]
fn wrap_phase(phase: f32) -> f32 {
    (phase + PI).rem_euclid(TWO_PI) - PI
}
