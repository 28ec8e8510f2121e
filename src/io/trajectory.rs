//! Trajectory files, space separated.
//!
//! - EuRoC: `timestamp_ns tx ty tz qx qy qz qw`
//! - TUM: `timestamp_s tx ty tz qx qy qz qw`

use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;

use crate::geometry::SE3;

/// A timestamped camera pose (T_wc).
#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    /// Seconds.
    pub timestamp: f64,
    pub pose: SE3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeFormat {
    Nanoseconds,
    Seconds,
}

pub fn save_trajectory_euroc(path: impl AsRef<Path>, entries: &[TrajectoryEntry]) -> Result<()> {
    write_trajectory(path.as_ref(), entries, TimeFormat::Nanoseconds)
}

pub fn save_trajectory_tum(path: impl AsRef<Path>, entries: &[TrajectoryEntry]) -> Result<()> {
    write_trajectory(path.as_ref(), entries, TimeFormat::Seconds)
}

fn write_trajectory(path: &Path, entries: &[TrajectoryEntry], format: TimeFormat) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    for entry in entries {
        let t = &entry.pose.translation;
        let q = entry.pose.rotation.quaternion();
        let timestamp = match format {
            TimeFormat::Nanoseconds => format!("{}", (entry.timestamp * 1e9).round() as i64),
            TimeFormat::Seconds => format!("{:.6}", entry.timestamp),
        };
        writer.write_record([
            timestamp,
            format!("{:.9}", t.x),
            format!("{:.9}", t.y),
            format!("{:.9}", t.z),
            format!("{:.9}", q.i),
            format!("{:.9}", q.j),
            format!("{:.9}", q.k),
            format!("{:.9}", q.w),
        ])?;
    }

    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn entries() -> Vec<TrajectoryEntry> {
        vec![
            TrajectoryEntry {
                timestamp: 1.5,
                pose: SE3::identity(),
            },
            TrajectoryEntry {
                timestamp: 1403636579.7635555,
                pose: SE3 {
                    rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
                    translation: Vector3::new(1.0, -2.0, 0.5),
                },
            },
        ]
    }

    #[test]
    fn test_euroc_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f_test.txt");
        save_trajectory_euroc(&path, &entries()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "1500000000 0.000000000 0.000000000 0.000000000 0.000000000 0.000000000 0.000000000 1.000000000"
        );

        let fields: Vec<&str> = lines[1].split(' ').collect();
        assert_eq!(fields.len(), 8);
        assert!(fields[0].starts_with("14036365797635"));
        assert_eq!(fields[1], "1.000000000");
        assert_eq!(fields[2], "-2.000000000");
        // 90 degrees about z.
        let qz: f64 = fields[6].parse().unwrap();
        let qw: f64 = fields[7].parse().unwrap();
        assert!((qz - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((qw - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_tum_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kf_test.txt");
        save_trajectory_tum(&path, &entries()[..1]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("1.500000 0.000000000"));
    }

    #[test]
    fn test_unwritable_path() {
        let err = save_trajectory_euroc("/nonexistent/dir/f.txt", &entries()).unwrap_err();
        assert!(err.to_string().contains("Failed to create"));
    }
}
