//! KeyFrame - a frame retained in the map.
//!
//! KeyFrames own their features and descriptors, the association of each
//! feature to a MapPoint, a Bag-of-Words vector for place recognition and the
//! weighted covisibility edges to other KeyFrames.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, Feature};
use crate::tracking::tracking_frame::FeatureGrid;
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Camera-to-world transform (T_wc).
    pub pose: SE3,

    pub features: Vec<Feature>,
    pub descriptors: Vec<Descriptor>,

    /// map_point_ids[i] = Some(mp) if feature i observes MapPoint mp.
    map_point_ids: Vec<Option<MapPointId>>,

    grid: FeatureGrid,

    bow_vector: Option<BowVector>,
    feature_vector: FeatureVector,

    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    pub is_bad: bool,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        timestamp: f64,
        pose: SE3,
        features: Vec<Feature>,
        descriptors: Vec<Descriptor>,
        img_width: f64,
        img_height: f64,
    ) -> Self {
        let n = features.len();
        let grid = FeatureGrid::new(&features, img_width, img_height);
        Self {
            id,
            timestamp,
            pose,
            features,
            descriptors,
            map_point_ids: vec![None; n],
            grid,
            bow_vector: None,
            feature_vector: FeatureVector::new(),
            covisibility_weights: HashMap::new(),
            is_bad: false,
        }
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform.
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn set_bow(&mut self, bow: BowVector, feature_vector: FeatureVector) {
        self.bow_vector = Some(bow);
        self.feature_vector = feature_vector;
    }

    pub fn bow_vector(&self) -> Option<&BowVector> {
        self.bow_vector.as_ref()
    }

    /// Feature indices grouped by vocabulary node.
    pub fn feature_vector(&self) -> &FeatureVector {
        &self.feature_vector
    }

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous association of the feature, if any.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// (feature index, MapPoint) pairs of all associated features.
    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    /// Add or overwrite a covisibility edge. Self-edges are ignored.
    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id != self.id {
            self.covisibility_weights.insert(kf_id, weight);
        }
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    /// The `n` covisible KeyFrames sharing the most MapPoints, best first.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Ties broken by id so the order is deterministic.
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        ordered.into_iter().take(n).map(|(id, _)| id).collect()
    }

    pub fn features_in_area(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        self.grid
            .cell_candidates(x, y, r)
            .into_iter()
            .filter(|&idx| {
                let p = self.features[idx].pt;
                (p.x - x).abs() < r && (p.y - y).abs() < r
            })
            .collect()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.features.len())
            .field("num_map_points", &self.num_map_points())
            .finish()
    }
}
