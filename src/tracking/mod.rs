//! Tracking: estimates the camera pose of every incoming frame.
//!
//! - Frame processing (ORB extraction, feature grid)
//! - Monocular two-view initialization
//! - Initial pose estimation (constant-velocity model, reference keyframe, relocalization)
//! - Track local map (projection-based search + PnP refinement)
//! - New KeyFrame decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod motion_model;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;

pub use result::{TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::{Tracker, TrajectoryRecord};
