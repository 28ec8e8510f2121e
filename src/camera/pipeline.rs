//! GStreamer pipeline for CSI cameras on Jetson boards.

use std::fmt;

/// A CSI camera read through `nvarguscamerasrc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsiCamera {
    pub sensor_id: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub flip_method: u32,
}

impl Default for CsiCamera {
    fn default() -> Self {
        Self {
            sensor_id: 0,
            width: 640,
            height: 480,
            framerate: 10,
            flip_method: 0,
        }
    }
}

impl CsiCamera {
    /// Pipeline capturing NV12 on the ISP and delivering BGR frames to an appsink.
    pub fn pipeline(&self) -> String {
        format!(
            "nvarguscamerasrc sensor_id={} ! video/x-raw(memory:NVMM), width={}, height={}, \
             format=(string)NV12, framerate={}/1 ! nvvidconv flip-method={} ! \
             video/x-raw, format=(string)BGRx ! videoconvert ! video/x-raw, format=(string)BGR ! appsink",
            self.sensor_id, self.width, self.height, self.framerate, self.flip_method
        )
    }
}

impl fmt::Display for CsiCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CSI sensor {} ({}x{} @ {} fps, flip {})",
            self.sensor_id, self.width, self.height, self.framerate, self.flip_method
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline() {
        assert_eq!(
            CsiCamera::default().pipeline(),
            "nvarguscamerasrc sensor_id=0 ! video/x-raw(memory:NVMM), width=640, height=480, \
             format=(string)NV12, framerate=10/1 ! nvvidconv flip-method=0 ! video/x-raw, \
             format=(string)BGRx ! videoconvert ! video/x-raw, format=(string)BGR ! appsink"
        );
    }

    #[test]
    fn test_custom_pipeline() {
        let cam = CsiCamera {
            sensor_id: 1,
            width: 1280,
            height: 720,
            framerate: 30,
            flip_method: 2,
        };
        let p = cam.pipeline();
        assert!(p.starts_with("nvarguscamerasrc sensor_id=1 ! "));
        assert!(p.contains("width=1280, height=720, format=(string)NV12, framerate=30/1"));
        assert!(p.contains("nvvidconv flip-method=2 ! "));
        assert!(p.ends_with("! appsink"));
        assert!(!p.contains("  "));
    }
}
