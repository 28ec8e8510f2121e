//! Per-frame tracking summary, consumed by the viewer.

use nalgebra::Point2;

use crate::geometry::SE3;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: u64,
    pub timestamp: f64,
    pub state: TrackingState,
    /// Camera pose (T_wc) when tracking succeeded.
    pub pose: Option<SE3>,
    pub metrics: TrackingMetrics,
    /// Raw pixel positions of all features, for drawing.
    pub features: Vec<Point2<f64>>,
    /// Indices into `features` associated with map points.
    pub matched: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    pub n_matches: usize,
    pub n_inliers: usize,
    pub new_keyframe: bool,
    pub elapsed_ms: f64,
}
