//! Narrow interface the capture driver uses to feed a SLAM engine.

use anyhow::Result;
use opencv::core::Mat;

use crate::tracking::TrackingState;

pub trait MonocularSlam {
    /// Factor frames must be resized by before tracking.
    fn image_scale(&self) -> f64;

    /// Track one image captured at `timestamp`, in seconds since the Unix epoch.
    ///
    /// Seconds rather than whole milliseconds: the loss timeout and the
    /// trajectory files are expressed in seconds.
    fn track_monocular(&mut self, image: &Mat, timestamp: f64) -> Result<TrackingState>;

    fn insert_resize_time(&mut self, ms: f64);

    fn insert_track_time(&mut self, ms: f64);

    /// Stop all engine threads. Calling it again is a no-op.
    fn shutdown(&mut self);
}
