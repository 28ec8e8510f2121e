//! Rerun-based visualization for monocular SLAM.
//!
//! Entity hierarchy:
//!     status               - Status bar with tracking state and key metrics
//!     camera/
//!         image            - Grayscale camera image
//!         image/matched    - Features matched to map points (green dots)
//!         image/unmatched  - Unmatched ORB features (gray dots)
//!     world/
//!         camera           - Current camera pose
//!         trajectory       - Trajectory line (gray, thin)
//!         keyframes        - Keyframe centers (blue boxes)
//!         map_points       - Active map points (dim, LOD filtered)
//!     plots/
//!         inlier_count     - Temporal plot
//!         track_time_ms    - Temporal plot

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use opencv::core::Mat;
use opencv::prelude::*;
use rerun::{RecordingStream, external::glam};

use crate::geometry::SE3;
use crate::system::SharedState;
use crate::tracking::{TrackingMetrics, TrackingResult, TrackingState};

/// Longest trajectory kept for drawing.
const MAX_TRAJECTORY_POINTS: usize = 5000;

pub struct RerunVisualizer {
    rec: RecordingStream,
    trajectory: Vec<Vector3<f64>>,
    frame_times: Vec<Instant>,
    start_timestamp: Option<f64>,
}

impl RerunVisualizer {
    pub fn new(app_name: &str) -> Result<Self> {
        // Runs rerun viewer in a separate process
        let rec = rerun::RecordingStreamBuilder::new(app_name)
            .spawn()
            .context("Failed to spawn rerun viewer")?;

        // Monocular maps live in the first camera frame: X right, Y down, Z forward.
        rec.log_static("world", &rerun::ViewCoordinates::RDF()).ok();

        Ok(Self {
            rec,
            trajectory: Vec::new(),
            frame_times: Vec::new(),
            start_timestamp: None,
        })
    }

    /// Log everything known about one tracked frame.
    pub fn log_frame(&mut self, gray: &Mat, result: &TrackingResult, shared: &Arc<SharedState>) {
        self.set_time(result.timestamp);
        let fps = self.tick();

        self.log_image_feed(gray);
        self.log_features(result);
        self.log_temporal_plots(&result.metrics);

        if let Some(pose) = &result.pose {
            self.log_camera_pose(pose);
            if self.trajectory.len() >= MAX_TRAJECTORY_POINTS {
                self.trajectory.remove(0);
            }
            self.trajectory.push(pose.translation);
            self.log_trajectory();
        }

        let (map_index, n_keyframes, n_map_points) = {
            let atlas = shared.atlas.read();
            let map = atlas.active_map();
            if result.metrics.new_keyframe || result.state != TrackingState::Ok {
                let centers: Vec<Vector3<f64>> =
                    map.keyframes().filter(|kf| !kf.is_bad).map(|kf| kf.camera_center()).collect();
                self.log_keyframes(&centers);

                let points: Vec<Vector3<f64>> =
                    map.map_points().filter(|mp| !mp.is_bad).map(|mp| mp.position).collect();
                let camera_pos = result.pose.as_ref().map_or_else(Vector3::zeros, |p| p.translation);
                self.log_map_points_lod(&points, camera_pos);
            }
            (atlas.active_map_index(), map.num_keyframes(), map.num_map_points())
        };

        self.log_status_bar(result, map_index, n_keyframes, n_map_points, fps);
    }

    /// Set the current timestamp for all subsequent logs (relative to the first frame).
    fn set_time(&mut self, timestamp: f64) {
        let start = *self.start_timestamp.get_or_insert(timestamp);
        self.rec.set_duration_secs("time", (timestamp - start).max(0.0));
    }

    fn tick(&mut self) -> f64 {
        self.frame_times.push(Instant::now());
        if self.frame_times.len() > 100 {
            self.frame_times.remove(0);
        }
        match (self.frame_times.first(), self.frame_times.last()) {
            (Some(first), Some(last)) if self.frame_times.len() >= 2 => {
                let dt = last.duration_since(*first).as_secs_f64();
                if dt > 0.0 {
                    (self.frame_times.len() - 1) as f64 / dt
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    fn log_status_bar(
        &self,
        result: &TrackingResult,
        map_index: usize,
        n_keyframes: usize,
        n_map_points: usize,
        fps: f64,
    ) {
        let metrics = &result.metrics;
        let status_text = format!(
            "**{}** | Map: {} | KFs: {} | MPs: {} | Features: {} | Matched: {} | Inliers: {} | FPS: {:.1}",
            result.state,
            map_index,
            n_keyframes,
            n_map_points,
            metrics.n_features,
            metrics.n_matches,
            metrics.n_inliers,
            fps
        );

        self.rec
            .log(
                "status",
                &rerun::TextDocument::new(status_text).with_media_type(rerun::MediaType::markdown()),
            )
            .ok();
    }

    fn log_image_feed(&self, gray: &Mat) {
        if let Ok((data, width, height)) = mat_to_image_data(gray) {
            self.rec
                .log("camera/image", &rerun::Image::from_l8(data, [width, height]))
                .ok();
        }
    }

    fn log_features(&self, result: &TrackingResult) {
        let matched: HashSet<usize> = result.matched.iter().copied().collect();
        let (mut matched_points, mut unmatched_points) = (Vec::new(), Vec::new());
        for (idx, p) in result.features.iter().enumerate() {
            let pt = [p.x as f32, p.y as f32];
            if matched.contains(&idx) {
                matched_points.push(pt);
            } else {
                unmatched_points.push(pt);
            }
        }

        self.rec
            .log(
                "camera/image/matched",
                &rerun::Points2D::new(matched_points)
                    .with_colors([[0u8, 255, 0]])
                    .with_radii([3.0f32]),
            )
            .ok();
        self.rec
            .log(
                "camera/image/unmatched",
                &rerun::Points2D::new(unmatched_points)
                    .with_colors([[128u8, 128, 128]])
                    .with_radii([2.0f32]),
            )
            .ok();
    }

    fn log_camera_pose(&self, pose: &SE3) {
        let translation = glam::Vec3::new(
            pose.translation.x as f32,
            pose.translation.y as f32,
            pose.translation.z as f32,
        );
        let rotation = glam::Quat::from_xyzw(
            pose.rotation.coords.x as f32,
            pose.rotation.coords.y as f32,
            pose.rotation.coords.z as f32,
            pose.rotation.w as f32,
        );

        self.rec
            .log(
                "world/camera",
                &rerun::Transform3D::from_translation_rotation(translation, rotation),
            )
            .ok();
    }

    fn log_trajectory(&self) {
        if self.trajectory.len() < 2 {
            return;
        }
        let pts: Vec<[f32; 3]> = self.trajectory.iter().map(to_f32).collect();

        self.rec
            .log(
                "world/trajectory",
                &rerun::LineStrips3D::new([pts])
                    .with_colors([[128u8, 128, 128]])
                    .with_radii([0.005f32]),
            )
            .ok();
    }

    fn log_keyframes(&self, centers: &[Vector3<f64>]) {
        let pts: Vec<[f32; 3]> = centers.iter().map(to_f32).collect();
        let sizes = vec![[0.05f32, 0.05, 0.05]; pts.len()];
        self.rec
            .log(
                "world/keyframes",
                &rerun::Boxes3D::from_centers_and_sizes(pts, sizes).with_colors([[0u8, 100, 255]]),
            )
            .ok();
    }

    fn log_map_points_lod(&self, points: &[Vector3<f64>], camera_pos: Vector3<f64>) {
        let filtered = filter_points_lod(points, camera_pos, 10.0, 50.0, 10);
        let pts: Vec<[f32; 3]> = filtered.iter().map(to_f32).collect();

        self.rec
            .log(
                "world/map_points",
                &rerun::Points3D::new(pts)
                    .with_colors([[200u8, 200, 200]])
                    .with_radii([0.01f32]),
            )
            .ok();
    }

    fn log_temporal_plots(&self, metrics: &TrackingMetrics) {
        self.rec
            .log(
                "plots/inlier_count",
                &rerun::Scalars::new([metrics.n_inliers as f64]),
            )
            .ok();
        self.rec
            .log("plots/track_time_ms", &rerun::Scalars::new([metrics.elapsed_ms]))
            .ok();
    }
}

fn to_f32(p: &Vector3<f64>) -> [f32; 3] {
    [p.x as f32, p.y as f32, p.z as f32]
}

/// Filter points using Level-of-Detail (LOD) based on distance from camera.
///
/// - Points within `near_threshold`: keep all
/// - Points between thresholds: keep every third
/// - Points beyond `far_threshold`: keep 1 in `far_downsample`
fn filter_points_lod(
    points: &[Vector3<f64>],
    camera_pos: Vector3<f64>,
    near_threshold: f64,
    far_threshold: f64,
    far_downsample: usize,
) -> Vec<Vector3<f64>> {
    let mut result = Vec::new();
    let mut medium = 0usize;
    let mut far = 0usize;

    for point in points {
        let dist = (point - camera_pos).norm();
        if dist < near_threshold {
            result.push(*point);
        } else if dist < far_threshold {
            if medium % 3 == 0 {
                result.push(*point);
            }
            medium += 1;
        } else {
            if far % far_downsample.max(1) == 0 {
                result.push(*point);
            }
            far += 1;
        }
    }

    result
}

/// Convert a single-channel OpenCV Mat to image data (bytes, width, height).
fn mat_to_image_data(mat: &Mat) -> Result<(Vec<u8>, u32, u32), opencv::Error> {
    let rows = mat.rows() as u32;
    let cols = mat.cols() as u32;
    let data = if mat.is_continuous() {
        mat.data_bytes()?.to_vec()
    } else {
        mat.try_clone()?.data_bytes()?.to_vec()
    };
    Ok((data, cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lod_keeps_near_points() {
        let origin = Vector3::zeros();
        let near: Vec<Vector3<f64>> = (0..5).map(|i| Vector3::new(i as f64, 0.0, 1.0)).collect();
        assert_eq!(filter_points_lod(&near, origin, 10.0, 50.0, 10).len(), 5);
    }

    #[test]
    fn test_lod_downsamples_far_points() {
        let origin = Vector3::zeros();
        let medium: Vec<Vector3<f64>> = (0..9).map(|_| Vector3::new(0.0, 0.0, 20.0)).collect();
        let far: Vec<Vector3<f64>> = (0..20).map(|_| Vector3::new(0.0, 0.0, 100.0)).collect();
        assert_eq!(filter_points_lod(&medium, origin, 10.0, 50.0, 10).len(), 3);
        assert_eq!(filter_points_lod(&far, origin, 10.0, 50.0, 10).len(), 2);
    }
}
