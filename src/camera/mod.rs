//! Camera capture: CSI pipeline construction and OpenCV frame sources.

pub mod capture;
pub mod pipeline;

pub use capture::{CaptureSource, FrameSource, OpenCvCapture};
pub use pipeline::CsiCamera;
