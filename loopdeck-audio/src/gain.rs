//! Gain stage with click-free ramps

/// Gain applied to an interleaved stereo buffer, ramping linearly between levels
#[derive(Debug, Clone)]
pub struct GainStage {
    /// Level the ramp is heading towards
    target: f32,
    /// Level applied to the next frame
    current: f32,
    /// Per-frame increment while ramping
    step: f32,
    /// Frames left in the current ramp
    remaining: u32,
}

impl GainStage {
    /// Allowed level range
    pub const MAX_LEVEL: f32 = 2.0;

    pub fn new(level: f32) -> Self {
        let level = level.clamp(0.0, Self::MAX_LEVEL);
        Self {
            target: level,
            current: level,
            step: 0.0,
            remaining: 0,
        }
    }

    /// Ramp to `level` over `frames` frames. Zero frames jumps immediately.
    pub fn ramp_to(&mut self, level: f32, frames: u32) {
        self.target = level.clamp(0.0, Self::MAX_LEVEL);
        if frames == 0 {
            self.current = self.target;
            self.remaining = 0;
            self.step = 0.0;
        } else {
            self.step = (self.target - self.current) / frames as f32;
            self.remaining = frames;
        }
    }

    pub fn level(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Apply to interleaved stereo samples in place
    pub fn process(&mut self, buffer: &mut [f32]) {
        if self.remaining == 0 {
            if self.current != 1.0 {
                for sample in buffer.iter_mut() {
                    *sample *= self.current;
                }
            }
            return;
        }

        for frame in buffer.chunks_exact_mut(2) {
            if self.remaining > 0 {
                self.current += self.step;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.current = self.target;
                }
            }
            frame[0] *= self.current;
            frame[1] *= self.current;
        }
    }
}

impl Default for GainStage {
    fn default() -> Self {
        Self::new(1.0)
    }
}
