//! Sensor configurations an engine can be built for.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Monocular,
    ImuMonocular,
    Stereo,
    ImuStereo,
    Rgbd,
    ImuRgbd,
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Sensor::Monocular => "Monocular",
            Sensor::ImuMonocular => "Monocular-Inertial",
            Sensor::Stereo => "Stereo",
            Sensor::ImuStereo => "Stereo-Inertial",
            Sensor::Rgbd => "RGB-D",
            Sensor::ImuRgbd => "RGB-D-Inertial",
        };
        f.write_str(name)
    }
}
