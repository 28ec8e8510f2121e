//! KeyFrame decision criteria for monocular tracking.

/// Minimum tracked points for a frame to be worth inserting.
const MIN_TRACKED_POINTS: usize = 15;

/// Criteria for deciding whether to create a new KeyFrame.
///
/// A KeyFrame is inserted when either
/// - `max_frames` frames passed since the last one, or
/// - the frame tracks fewer than `min_tracked_ratio` of the points the
///   reference KeyFrame tracks,
///
/// provided it still tracks enough points and Local Mapping is not
/// applying back-pressure.
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    max_frames: usize,
    min_tracked_ratio: f64,
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    /// `fps` bounds the number of frames between KeyFrames.
    pub fn new(fps: f64) -> Self {
        Self {
            max_frames: (fps.round() as usize).max(1),
            min_tracked_ratio: 0.9,
            frames_since_kf: 0,
        }
    }

    /// Decide whether the current frame becomes a KeyFrame.
    ///
    /// * `tracked_points` - map points tracked in the current frame
    /// * `reference_points` - map points of the reference KeyFrame
    /// * `mapping_busy` - Local Mapping back-pressure flag
    pub fn should_create_keyframe(
        &mut self,
        tracked_points: usize,
        reference_points: usize,
        mapping_busy: bool,
    ) -> bool {
        self.frames_since_kf += 1;

        if mapping_busy {
            return false;
        }
        if tracked_points <= MIN_TRACKED_POINTS {
            return false;
        }

        let timeout = self.frames_since_kf >= self.max_frames;
        let weak = reference_points > 0
            && (tracked_points as f64) < self.min_tracked_ratio * reference_points as f64;

        if timeout || weak {
            self.frames_since_kf = 0;
            return true;
        }
        false
    }

    /// Reset after KeyFrame creation outside the decision (initialization, relocalization).
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_creates_keyframe() {
        let mut d = KeyFrameDecision::new(3.0);
        assert!(!d.should_create_keyframe(100, 100, false));
        assert!(!d.should_create_keyframe(100, 100, false));
        assert!(d.should_create_keyframe(100, 100, false));
        assert!(!d.should_create_keyframe(100, 100, false));
    }

    #[test]
    fn test_low_tracked_ratio_creates_keyframe() {
        let mut d = KeyFrameDecision::new(30.0);
        assert!(!d.should_create_keyframe(95, 100, false));
        assert!(d.should_create_keyframe(80, 100, false));
    }

    #[test]
    fn test_back_pressure_and_weak_tracking_block() {
        let mut d = KeyFrameDecision::new(1.0);
        assert!(!d.should_create_keyframe(80, 100, true));
        assert!(!d.should_create_keyframe(10, 100, false));
        assert!(d.should_create_keyframe(50, 100, false));
    }

    #[test]
    fn test_weak_tracking_right_after_keyframe() {
        let mut d = KeyFrameDecision::new(30.0);
        d.reset();
        assert!(d.should_create_keyframe(40, 100, false));
        assert!(d.should_create_keyframe(40, 100, false));
    }
}
