//! Atlas module - multi-map SLAM data structures.
//!
//! - [`map`] - KeyFrames, MapPoints and the covisibility graph of one map
//! - [`atlas::Atlas`] - active map plus maps stored after tracking loss
//! - [`keyframe_db::KeyFrameDatabase`] - BoW index for relocalization

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::Atlas;
pub use keyframe_db::KeyFrameDatabase;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
