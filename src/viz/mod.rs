//! Optional live visualization.

pub mod rerun;

pub use self::rerun::RerunVisualizer;
