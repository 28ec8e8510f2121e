//! Atlas - multi-map container.
//!
//! The Atlas owns one or more `Map` instances:
//! - One **active** map where Tracking and Local Mapping operate.
//! - Zero or more stored maps left behind when tracking was lost with a
//!   mature map.
//!
//! It also owns the `KeyFrameDatabase` used for relocalization. KeyFrame and
//! MapPoint ids are unique across all maps of an Atlas.

use crate::atlas::map::Map;
use crate::tracking::frame::ScalePyramid;

use super::keyframe_db::KeyFrameDatabase;

/// Index of a map inside the Atlas.
pub type MapIndex = usize;

pub struct Atlas {
    maps: Vec<Map>,
    active_map_idx: MapIndex,
    pyramid: ScalePyramid,
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    /// Create a new Atlas with a single empty active map.
    pub fn new(pyramid: ScalePyramid) -> Self {
        Self {
            maps: vec![Map::starting_at(0, 0, pyramid.clone())],
            active_map_idx: 0,
            pyramid,
            keyframe_db: KeyFrameDatabase::new(),
        }
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn active_map_index(&self) -> MapIndex {
        self.active_map_idx
    }

    pub fn active_map(&self) -> &Map {
        &self.maps[self.active_map_idx]
    }

    pub fn active_map_mut(&mut self) -> &mut Map {
        &mut self.maps[self.active_map_idx]
    }

    pub fn all_maps(&self) -> &[Map] {
        &self.maps
    }

    /// KeyFrames of all maps.
    pub fn total_keyframes(&self) -> usize {
        self.maps.iter().map(|m| m.num_keyframes()).sum()
    }

    /// Store the active map and start a fresh one.
    ///
    /// Ids of the new map continue after the largest id handed out so far.
    pub fn create_new_map(&mut self) -> MapIndex {
        let (next_kf, next_mp) = self
            .maps
            .iter()
            .map(|m| m.next_ids())
            .fold((0, 0), |(a, b), (kf, mp)| (a.max(kf), b.max(mp)));
        self.maps
            .push(Map::starting_at(next_kf, next_mp, self.pyramid.clone()));
        self.active_map_idx = self.maps.len() - 1;
        tracing::info!(
            map_index = self.active_map_idx,
            first_kf_id = next_kf,
            "Created new map"
        );
        self.active_map_idx
    }

    /// Drop every KeyFrame and MapPoint of the active map.
    pub fn reset_active_map(&mut self) {
        let map = &mut self.maps[self.active_map_idx];
        for kf_id in map.keyframe_ids() {
            self.keyframe_db.erase(kf_id);
        }
        let (kfs, mps) = (map.num_keyframes(), map.num_map_points());
        map.clear();
        tracing::info!(
            map_index = self.active_map_idx,
            keyframes = kfs,
            map_points = mps,
            "Reset active map"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::vocabulary::{BowVector, FeatureVector};

    fn add_keyframe(atlas: &mut Atlas) {
        let idx = atlas.active_map_index();
        let kf_id = atlas
            .active_map_mut()
            .create_keyframe(0.0, SE3::identity(), Vec::new(), Vec::new(), 640.0, 480.0);
        let bow: BowVector = [(1, 1.0)].into_iter().collect();
        if let Some(kf) = atlas.active_map_mut().get_keyframe_mut(kf_id) {
            kf.set_bow(bow.clone(), FeatureVector::new());
        }
        atlas.keyframe_db.add(kf_id, &bow, idx);
    }

    #[test]
    fn test_new_map_continues_ids() {
        let mut atlas = Atlas::new(ScalePyramid::new(1.2, 8));
        add_keyframe(&mut atlas);
        add_keyframe(&mut atlas);

        let idx = atlas.create_new_map();
        assert_eq!(idx, 1);
        assert_eq!(atlas.num_maps(), 2);
        assert_eq!(atlas.active_map().num_keyframes(), 0);

        add_keyframe(&mut atlas);
        assert_eq!(atlas.active_map().last_keyframe_id().map(|id| id.0), Some(2));
        assert_eq!(atlas.total_keyframes(), 3);
    }

    #[test]
    fn test_reset_active_map_clears_database() {
        let mut atlas = Atlas::new(ScalePyramid::new(1.2, 8));
        add_keyframe(&mut atlas);
        assert_eq!(atlas.keyframe_db.len(), 1);

        atlas.reset_active_map();
        assert_eq!(atlas.active_map().num_keyframes(), 0);
        assert_eq!(atlas.keyframe_db.len(), 0);
        assert_eq!(atlas.num_maps(), 1);
    }
}
