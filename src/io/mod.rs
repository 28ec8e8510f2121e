//! File IO: engine settings and trajectory output.

pub mod settings;
pub mod trajectory;

pub use settings::{Settings, SettingsError};
pub use trajectory::{TrajectoryEntry, save_trajectory_euroc, save_trajectory_tum};
