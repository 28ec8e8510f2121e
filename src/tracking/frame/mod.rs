//! Frame-level processing: camera model and ORB feature extraction.

pub mod camera;
pub mod orb;

pub use camera::CameraModel;
pub use orb::{
    Descriptor, Feature, FeatureSet, OrbExtractor, OrbParams, ScalePyramid, descriptor_distance,
};
