//! Loop-region boundaries and marker drag editing

use crate::error::EngineError;

/// A `[start, end]` range of a buffer, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Whole-buffer segment
    pub fn full(duration: f64) -> Self {
        Self::new(0.0, duration)
    }

    pub fn len(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0.0
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }

    /// Clamp `t` into the segment. NaN maps to `start`.
    pub fn clamp(&self, t: f64) -> f64 {
        if t.is_nan() {
            return self.start;
        }
        t.clamp(self.start, self.end.max(self.start))
    }

    /// Fold `t` back into `[start, end)` as a looping source would
    pub fn wrap(&self, t: f64) -> f64 {
        let len = self.len();
        if len <= 0.0 || t.is_nan() {
            return self.start;
        }
        if t < self.start {
            return self.start;
        }
        self.start + (t - self.start).rem_euclid(len)
    }
}

/// Which boundary marker a pointer refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marker {
    Start,
    End,
    #[default]
    None,
}

/// Transient marker drag state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DragState {
    pub active: bool,
    pub which: Marker,
}

/// Owns a track's segment and the drag state machine that edits it.
///
/// Once [`reset`](Self::reset) has been called with a positive duration the
/// segment always satisfies `0 <= start`, `end <= duration` and
/// `end - start >= min_len`.
#[derive(Debug, Clone)]
pub struct SegmentModel {
    segment: Segment,
    drag: DragState,
    tolerance_px: f64,
    min_len: f64,
}

impl SegmentModel {
    pub fn new(tolerance_px: f64, min_len: f64) -> Self {
        Self {
            segment: Segment::default(),
            drag: DragState::default(),
            tolerance_px,
            min_len,
        }
    }

    /// Reset to the whole buffer and drop any drag in progress
    pub fn reset(&mut self, duration: f64) {
        self.segment = Segment::full(duration.max(0.0));
        self.drag = DragState::default();
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn drag(&self) -> DragState {
        self.drag
    }

    pub fn min_len(&self) -> f64 {
        self.min_len
    }

    /// Which marker, if any, lies within the pixel tolerance of `x`.
    /// Start wins when both are in range.
    pub fn hit_test(&self, x: f64, width: f64, duration: f64) -> Marker {
        if !(width > 0.0 && duration > 0.0) || !x.is_finite() {
            return Marker::None;
        }
        let to_px = |time: f64| (time / duration) * width;

        if (x - to_px(self.segment.start)).abs() <= self.tolerance_px {
            Marker::Start
        } else if (x - to_px(self.segment.end)).abs() <= self.tolerance_px {
            Marker::End
        } else {
            Marker::None
        }
    }

    pub fn begin_drag(&mut self, marker: Marker) {
        self.drag = DragState {
            active: marker != Marker::None,
            which: marker,
        };
    }

    /// Move the dragged boundary to the time under `x`.
    ///
    /// Returns the marker that was moved, or `Marker::None` if no drag is
    /// active or the geometry is degenerate.
    pub fn update_drag(&mut self, x: f64, width: f64, duration: f64) -> Marker {
        if !self.drag.active || !(width > 0.0 && duration > 0.0) || !x.is_finite() {
            return Marker::None;
        }
        let t = (x / width * duration).clamp(0.0, duration);

        match self.drag.which {
            Marker::Start => {
                let t = t.min(self.segment.end - self.min_len);
                self.segment.start = t.max(0.0);
            }
            Marker::End => {
                let t = t.max(self.segment.start + self.min_len);
                self.segment.end = t.min(duration);
            }
            Marker::None => return Marker::None,
        }
        self.drag.which
    }

    /// Finish the drag. Returns whether one was in progress.
    pub fn end_drag(&mut self) -> bool {
        let was_active = self.drag.active;
        self.drag = DragState::default();
        was_active
    }

    /// Replace the segment, keeping the old one if the new pair is invalid
    pub fn set(&mut self, start: f64, end: f64, duration: f64) -> Result<(), EngineError> {
        let valid = start.is_finite()
            && end.is_finite()
            && start >= 0.0
            && end <= duration
            && end - start >= self.min_len;
        if !valid {
            return Err(EngineError::InvalidSegment { start, end });
        }
        self.segment = Segment::new(start, end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 0.001;

    fn model(duration: f64) -> SegmentModel {
        let mut m = SegmentModel::new(5.0, EPS);
        m.reset(duration);
        m
    }

    #[test]
    fn test_reset_covers_whole_buffer() {
        let m = model(10.0);
        assert_eq!(m.segment(), Segment::new(0.0, 10.0));
        assert!(!m.drag().active);
    }

    #[test]
    fn test_hit_test_prefers_start() {
        let mut m = model(10.0);
        m.set(5.0, 5.01, 10.0).unwrap();
        // 1000px wide: start at 500px, end at 501px, both within tolerance
        assert_eq!(m.hit_test(500.5, 1000.0, 10.0), Marker::Start);
    }

    #[test]
    fn test_hit_test_tolerance_is_inclusive() {
        let m = model(10.0);
        assert_eq!(m.hit_test(5.0, 1000.0, 10.0), Marker::Start);
        assert_eq!(m.hit_test(995.0, 1000.0, 10.0), Marker::End);
        assert_eq!(m.hit_test(5.5, 1000.0, 10.0), Marker::None);
        assert_eq!(m.hit_test(500.0, 1000.0, 10.0), Marker::None);
    }

    #[test]
    fn test_hit_test_degenerate_geometry() {
        let m = model(10.0);
        assert_eq!(m.hit_test(0.0, 0.0, 10.0), Marker::None);
        assert_eq!(m.hit_test(0.0, 1000.0, 0.0), Marker::None);
    }

    #[test]
    fn test_drag_start_moves_boundary() {
        let mut m = model(10.0);
        m.begin_drag(Marker::Start);
        assert_eq!(m.update_drag(200.0, 1000.0, 10.0), Marker::Start);
        assert!((m.segment().start - 2.0).abs() < 1e-9);
        assert!(m.end_drag());
        assert!(!m.drag().active);
    }

    #[test]
    fn test_drag_start_cannot_pass_end() {
        let mut m = model(10.0);
        m.set(2.0, 8.0, 10.0).unwrap();
        m.begin_drag(Marker::Start);
        m.update_drag(950.0, 1000.0, 10.0);
        let seg = m.segment();
        assert!((seg.start - (8.0 - EPS)).abs() < 1e-9);
        assert!(seg.start < seg.end);
    }

    #[test]
    fn test_drag_end_clamped_above_start() {
        // Dragging End from 8.0 to 1.5 while start is 2.0
        let mut m = model(10.0);
        m.set(2.0, 8.0, 10.0).unwrap();
        m.begin_drag(Marker::End);
        m.update_drag(150.0, 1000.0, 10.0);
        let seg = m.segment();
        assert_eq!(seg.start, 2.0);
        assert!(seg.end >= seg.start + EPS - 1e-12);
        assert!(seg.end < 8.0);
    }

    #[test]
    fn test_drag_clamps_outside_track() {
        let mut m = model(10.0);
        m.begin_drag(Marker::End);
        m.update_drag(5000.0, 1000.0, 10.0);
        assert_eq!(m.segment().end, 10.0);

        m.begin_drag(Marker::Start);
        m.update_drag(-300.0, 1000.0, 10.0);
        assert_eq!(m.segment().start, 0.0);
    }

    #[test]
    fn test_update_without_drag_is_noop() {
        let mut m = model(10.0);
        assert_eq!(m.update_drag(300.0, 1000.0, 10.0), Marker::None);
        assert_eq!(m.segment(), Segment::new(0.0, 10.0));
        m.begin_drag(Marker::None);
        assert!(!m.drag().active);
        assert!(!m.end_drag());
    }

    #[test]
    fn test_set_rejects_invalid_and_keeps_previous() {
        let mut m = model(10.0);
        m.set(1.0, 9.0, 10.0).unwrap();
        assert!(m.set(5.0, 5.0, 10.0).is_err());
        assert!(m.set(-1.0, 5.0, 10.0).is_err());
        assert!(m.set(1.0, 11.0, 10.0).is_err());
        assert!(m.set(f64::NAN, 5.0, 10.0).is_err());
        assert_eq!(m.segment(), Segment::new(1.0, 9.0));
    }

    #[test]
    fn test_wrap_and_clamp() {
        let seg = Segment::new(2.0, 8.0);
        assert_eq!(seg.clamp(9.0), 8.0);
        assert_eq!(seg.clamp(f64::NAN), 2.0);
        assert!((seg.wrap(9.5) - 3.5).abs() < 1e-9);
        assert_eq!(seg.wrap(8.0), 2.0);
        assert_eq!(seg.wrap(1.0), 2.0);
    }

    #[test]
    fn test_invariant_holds_over_drag_sweep() {
        let mut m = model(10.0);
        for marker in [Marker::Start, Marker::End] {
            m.begin_drag(marker);
            for x in (-100..1100).step_by(7) {
                m.update_drag(x as f64, 1000.0, 10.0);
                let seg = m.segment();
                assert!(seg.start >= 0.0);
                assert!(seg.end <= 10.0);
                assert!(seg.end - seg.start >= EPS - 1e-12);
            }
            m.end_drag();
        }
    }
}
