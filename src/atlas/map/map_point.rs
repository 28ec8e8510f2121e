//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it, keeps visibility counters
//! for culling decisions, and stores the viewing geometry used to gate
//! projection search.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::tracking::frame::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor (the observation with least median distance).
    pub descriptor: Descriptor,

    /// observations[kf_id] = feature_idx in that KeyFrame.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance bounds.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point was predicted inside a frame.
    pub visible_count: u32,

    /// Times the point was actually matched.
    pub found_count: u32,

    /// KeyFrame that created this MapPoint.
    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// found / visible, 1.0 while never predicted visible.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    /// Update the mean normal vector and distance bounds from observer centers.
    ///
    /// `reference` is the center of the creating KeyFrame with the octave the
    /// point was detected at; the bounds follow the ORB pyramid around it.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        reference: Option<(&Vector3<f64>, f64)>,
        scale_factor: f64,
        num_levels: usize,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n == 0 {
            return;
        }
        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }

        if let Some((ref_center, level_scale)) = reference {
            let dist = (self.position - ref_center).norm();
            let max_level_scale = scale_factor.powi(num_levels as i32 - 1);
            self.max_distance = dist * level_scale;
            self.min_distance = self.max_distance / max_level_scale;
        }
    }

    /// Accept distances slightly outside the bounds, as ORB-SLAM does.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Predict the pyramid level at which the point appears at `distance`.
    pub fn predict_scale(&self, distance: f64, scale_factor: f64, num_levels: usize) -> i32 {
        if !self.max_distance.is_finite() || distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / scale_factor.ln()).ceil() as i32;
        level.clamp(0, num_levels as i32 - 1)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(0.0, 0.0, 4.0),
            [0u8; 32],
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mut mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 5);
        mp.add_observation(KeyFrameId::new(2), 10);
        assert_eq!(mp.num_observations(), 2);
        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = create_test_mappoint();
        assert_eq!(mp.found_ratio(), 1.0);
        mp.increase_visible(3);
        assert!((mp.found_ratio() - 0.25).abs() < 1e-12);
        mp.increase_found(1);
        assert!((mp.found_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_normal_and_depth() {
        let mut mp = create_test_mappoint();
        let centers = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 2.0)];
        mp.update_normal_and_depth(centers.iter(), Some((&centers[0], 1.0)), 1.2, 8);
        assert!((mp.normal - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-12);
        assert!((mp.max_distance - 4.0).abs() < 1e-12);
        assert!(mp.min_distance < mp.max_distance);
        assert!(mp.is_in_distance_range(3.0));
        assert!(!mp.is_in_distance_range(100.0));
    }

    #[test]
    fn test_predict_scale() {
        let mut mp = create_test_mappoint();
        mp.max_distance = 4.0;
        assert_eq!(mp.predict_scale(4.0, 1.2, 8), 0);
        assert_eq!(mp.predict_scale(4.0 / 1.3, 1.2, 8), 2);
        assert_eq!(mp.predict_scale(0.01, 1.2, 8), 7);
    }
}
