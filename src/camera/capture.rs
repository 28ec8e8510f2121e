//! Frame sources backed by OpenCV `VideoCapture`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use tracing::{info, warn};

use super::pipeline::CsiCamera;

/// Where frames come from.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureSource {
    Csi(CsiCamera),
    Device(i32),
    File(PathBuf),
    /// Raw GStreamer pipeline ending in an appsink.
    Pipeline(String),
}

impl CaptureSource {
    fn describe(&self) -> String {
        match self {
            CaptureSource::Csi(cam) => cam.to_string(),
            CaptureSource::Device(idx) => format!("device {idx}"),
            CaptureSource::File(path) => format!("file {}", path.display()),
            CaptureSource::Pipeline(p) => format!("pipeline `{p}`"),
        }
    }
}

/// A stream of BGR frames.
pub trait FrameSource {
    fn is_opened(&self) -> bool;

    /// Read the next frame into `frame`. Returns false when no frame was produced.
    fn read(&mut self, frame: &mut Mat) -> Result<bool>;

    fn release(&mut self) -> Result<()>;
}

pub struct OpenCvCapture {
    cap: VideoCapture,
}

impl OpenCvCapture {
    /// Open a capture source.
    ///
    /// A camera that cannot be reached does not make this fail; check
    /// [`FrameSource::is_opened`].
    pub fn open(source: &CaptureSource) -> Result<Self> {
        info!("Opening {}", source.describe());
        let cap = match source {
            CaptureSource::Csi(cam) => {
                VideoCapture::from_file(&cam.pipeline(), videoio::CAP_GSTREAMER)
            }
            CaptureSource::Pipeline(p) => VideoCapture::from_file(p, videoio::CAP_GSTREAMER),
            CaptureSource::Device(idx) => VideoCapture::new(*idx, videoio::CAP_ANY),
            CaptureSource::File(path) => {
                VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            }
        }
        .with_context(|| format!("Failed to create capture for {}", source.describe()))?;
        Ok(Self { cap })
    }
}

impl FrameSource for OpenCvCapture {
    fn is_opened(&self) -> bool {
        match self.cap.is_opened() {
            Ok(opened) => opened,
            Err(e) => {
                warn!("VideoCapture::isOpened failed: {e}");
                false
            }
        }
    }

    fn read(&mut self, frame: &mut Mat) -> Result<bool> {
        self.cap.read(frame).context("Failed to read frame")
    }

    fn release(&mut self) -> Result<()> {
        self.cap.release().context("Failed to release capture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_not_opened() {
        let source = CaptureSource::File(PathBuf::from("/nonexistent/video.mp4"));
        let mut cap = OpenCvCapture::open(&source).unwrap();
        assert!(!cap.is_opened());
        cap.release().unwrap();
    }

    #[test]
    fn test_describe() {
        assert_eq!(CaptureSource::Device(2).describe(), "device 2");
        assert!(CaptureSource::Csi(CsiCamera::default()).describe().contains("640x480"));
    }
}
