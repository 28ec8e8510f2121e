//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility relationships between KeyFrames
//!
//! Associations are always created through [`Map::associate`] so that both
//! sides of the KF↔MP link and the covisibility weights stay consistent.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, Feature, ScalePyramid, descriptor_distance};

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// KeyFrame ids in insertion order.
    keyframe_order: Vec<KeyFrameId>,

    next_kf_id: u64,
    next_mp_id: u64,

    pyramid: ScalePyramid,
}

impl Map {
    pub fn new() -> Self {
        Self::starting_at(0, 0, ScalePyramid::new(1.2, 8))
    }

    /// Empty map whose ids start at the given values.
    pub fn starting_at(first_kf_id: u64, first_mp_id: u64, pyramid: ScalePyramid) -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            keyframe_order: Vec::new(),
            next_kf_id: first_kf_id,
            next_mp_id: first_mp_id,
            pyramid,
        }
    }

    /// Ids the next created KeyFrame and MapPoint would receive.
    pub fn next_ids(&self) -> (u64, u64) {
        (self.next_kf_id, self.next_mp_id)
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_keyframe(
        &mut self,
        timestamp: f64,
        pose: SE3,
        features: Vec<Feature>,
        descriptors: Vec<Descriptor>,
        img_width: f64,
        img_height: f64,
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        let kf = KeyFrame::new(id, timestamp, pose, features, descriptors, img_width, img_height);
        self.keyframes.insert(id, kf);
        self.keyframe_order.push(id);
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// KeyFrames in insertion (temporal) order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframe_order
            .iter()
            .filter_map(|id| self.keyframes.get(id))
    }

    pub fn keyframe_ids(&self) -> &[KeyFrameId] {
        &self.keyframe_order
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.keyframe_order.last().copied()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// The `n` most covisible KeyFrames of `kf_id`.
    pub fn local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.best_covisibles(n))
            .unwrap_or_default()
    }

    /// The `n` most recent KeyFrames before `kf_id`, newest first.
    pub fn previous_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframe_order
            .iter()
            .rev()
            .filter(|id| **id != kf_id && id.0 < kf_id.0)
            .take(n)
            .copied()
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoints
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// MapPoints observed by any of the given KeyFrames, in id order.
    pub fn map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
        let mut set = BTreeSet::new();
        for kf_id in kf_ids {
            if let Some(kf) = self.keyframes.get(kf_id) {
                for (_, mp_id) in kf.map_point_indices() {
                    if self.map_points.get(&mp_id).is_some_and(|mp| !mp.is_bad) {
                        set.insert(mp_id);
                    }
                }
            }
        }
        set.into_iter().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// Covisibility with every other observer of the point is incremented.
    /// Returns false if either side does not exist or the feature is taken.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) if !mp.observations.contains_key(&kf_id) => {
                mp.observations.keys().copied().collect()
            }
            _ => return false,
        };

        match self.keyframes.get_mut(&kf_id) {
            Some(kf) if feature_idx < kf.num_features() && kf.get_map_point(feature_idx).is_none() => {
                kf.set_map_point(feature_idx, mp_id);
            }
            _ => return false,
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }

        for other_kf_id in existing_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.set_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the association of a KeyFrame feature, updating covisibility.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.get_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| {
                mp.observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(feature_idx);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }

        for other_kf_id in other_observers {
            self.decrement_covisibility(kf_id, other_kf_id);
        }

        Some(mp_id)
    }

    fn decrement_covisibility(&mut self, a: KeyFrameId, b: KeyFrameId) {
        let current = self
            .keyframes
            .get(&a)
            .map(|kf| kf.covisibility_weight(b))
            .unwrap_or(0);
        for (from, to) in [(a, b), (b, a)] {
            if let Some(kf) = self.keyframes.get_mut(&from) {
                if current <= 1 {
                    kf.erase_covisibility(to);
                } else {
                    kf.set_covisibility(to, current - 1);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute the viewing normal and scale-invariance distance bounds.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
            .collect();
        let reference = self.keyframes.get(&mp.first_kf_id).and_then(|kf| {
            let idx = *mp.observations.get(&kf.id)?;
            let octave = kf.features.get(idx)?.octave;
            Some((kf.camera_center(), self.pyramid.scale(octave)))
        });

        let scale_factor = self.pyramid.scale_factor;
        let n_levels = self.pyramid.n_levels();
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(
                centers.iter(),
                reference.as_ref().map(|(c, s)| (c, *s)),
                scale_factor,
                n_levels,
            );
        }
    }

    /// Pick the observation descriptor with the least median distance to the others.
    pub fn update_map_point_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let descriptors: Vec<Descriptor> = mp
            .observations
            .iter()
            .filter_map(|(kf_id, idx)| {
                self.keyframes
                    .get(kf_id)
                    .and_then(|kf| kf.descriptors.get(*idx).copied())
            })
            .collect();
        if let Some(best) = most_distinctive_descriptor(&descriptors) {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.descriptor = best;
            }
        }
    }

    /// Fully remove a MapPoint, cleaning up all associations.
    pub fn remove_map_point_full(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(k, i)| (*k, *i)).collect())
            .unwrap_or_default();

        for (kf_id, feat_idx) in observations {
            self.disassociate(kf_id, feat_idx);
        }
        self.map_points.remove(&mp_id);
    }

    /// Cull recently created MapPoints that did not prove themselves.
    ///
    /// A point is removed if it is bad, its found ratio is below 0.25, or it is
    /// at least two KeyFrames old with `min_observations` or fewer observers.
    /// Points older than three KeyFrames graduate and leave `recent`.
    /// Returns the number of removed points.
    pub fn cull_recent_map_points(
        &mut self,
        recent: &mut Vec<MapPointId>,
        current_kf: KeyFrameId,
        min_observations: usize,
    ) -> usize {
        let mut culled = 0;
        let mut keep = Vec::with_capacity(recent.len());

        for mp_id in recent.drain(..) {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            let age = current_kf.0.saturating_sub(mp.first_kf_id.0);
            if mp.is_bad || mp.found_ratio() < 0.25 || (age >= 2 && mp.num_observations() <= min_observations) {
                self.remove_map_point_full(mp_id);
                culled += 1;
            } else if age < 3 {
                keep.push(mp_id);
            }
        }

        *recent = keep;
        culled
    }

    /// Median depth of the MapPoints seen by a KeyFrame, in its camera frame.
    pub fn median_scene_depth(&self, kf_id: KeyFrameId) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let pose_cw = kf.pose_cw();
        let mut depths: Vec<f64> = kf
            .map_point_indices()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .map(|mp| pose_cw.transform_point(&mp.position).z)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[(depths.len() - 1) / 2])
    }

    /// Remove all content. Id counters keep running.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.keyframe_order.clear();
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .finish()
    }
}

fn most_distinctive_descriptor(descriptors: &[Descriptor]) -> Option<Descriptor> {
    if descriptors.is_empty() {
        return None;
    }
    let n = descriptors.len();
    let mut best_idx = 0;
    let mut best_median = u32::MAX;
    for i in 0..n {
        let mut dists: Vec<u32> = (0..n)
            .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
            .collect();
        dists.sort_unstable();
        let median = dists[(n - 1) / 2];
        if median < best_median {
            best_median = median;
            best_idx = i;
        }
    }
    Some(descriptors[best_idx])
}
