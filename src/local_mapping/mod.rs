//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Inserting new keyframes into the map and the keyframe database
//! - Triangulating new map points against neighbor keyframes
//! - Maintaining the covisibility graph
//! - Culling recently created map points that fail to be re-observed

mod local_mapper;
pub mod triangulation;

pub use local_mapper::LocalMapper;
