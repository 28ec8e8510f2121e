//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that runs Tracking and
//! spawns Local Mapping, the `MonocularSlam` interface the capture driver
//! talks to, shared state and inter-thread messaging types.

mod engine;
pub mod messages;
mod sensor;
pub mod shared_state;
mod slam_system;
pub mod timing;

pub use engine::MonocularSlam;
pub use messages::NewKeyFrameMsg;
pub use sensor::Sensor;
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
pub use timing::{TimingRegister, TimingStats};
