//! Inter-thread message types.

use crate::atlas::map::MapPointId;
use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, Feature};

/// Message sent from Tracking to Local Mapping when a frame becomes a keyframe.
///
/// Local Mapping inserts the keyframe, associates the tracked map points and
/// triangulates new points against its neighbors.
#[derive(Debug, Clone)]
pub struct NewKeyFrameMsg {
    /// Map generation the frame was tracked against.
    pub map_generation: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose estimate from Tracking (T_wc).
    pub pose: SE3,

    pub features: Vec<Feature>,
    pub descriptors: Vec<Descriptor>,

    /// `matched_map_points[i] = Some(mp_id)` if feature i was tracked.
    pub matched_map_points: Vec<Option<MapPointId>>,

    pub img_width: f64,
    pub img_height: f64,
}
