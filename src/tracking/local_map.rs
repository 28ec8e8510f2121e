//! Local map used by "Track Local Map".
//!
//! The local map is the set of KeyFrames that share map points with the
//! current frame (K1), extended by their most covisible neighbors (K2), and
//! every map point those KeyFrames observe.

use std::collections::{BTreeMap, HashSet};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};

/// Upper bound on local KeyFrames.
const MAX_LOCAL_KEYFRAMES: usize = 80;
const NEIGHBORS_PER_KEYFRAME: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyFrameId>,
    pub map_points: Vec<MapPointId>,
    /// KeyFrame sharing the most map points with the frame.
    pub reference: Option<KeyFrameId>,
}

impl LocalMap {
    /// Build the local map around the map points matched in the current frame.
    pub fn build(map: &Map, matches: &[Option<MapPointId>]) -> Self {
        let mut votes: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for mp_id in matches.iter().flatten() {
            if let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) {
                for kf_id in mp.observations.keys() {
                    *votes.entry(*kf_id).or_insert(0) += 1;
                }
            }
        }

        let reference = votes
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
            .map(|(id, _)| *id);

        let mut keyframes: Vec<KeyFrameId> = votes.keys().copied().collect();
        let mut seen: HashSet<KeyFrameId> = keyframes.iter().copied().collect();

        let k1 = keyframes.clone();
        'outer: for kf_id in k1 {
            for neighbor in map.local_keyframes(kf_id, NEIGHBORS_PER_KEYFRAME) {
                if keyframes.len() >= MAX_LOCAL_KEYFRAMES {
                    break 'outer;
                }
                if seen.insert(neighbor) {
                    keyframes.push(neighbor);
                }
            }
        }

        let map_points = map.map_points_from_keyframes(&keyframes);
        Self {
            keyframes,
            map_points,
            reference,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::Feature;
    use nalgebra::Vector3;

    fn kf(map: &mut Map) -> KeyFrameId {
        let features = (0..4).map(|i| Feature::at(i as f64 * 10.0, 0.0, 0)).collect();
        map.create_keyframe(0.0, SE3::identity(), features, vec![[0u8; 32]; 4], 640.0, 480.0)
    }

    #[test]
    fn test_build_collects_neighbors_and_points() {
        let mut map = Map::new();
        let a = kf(&mut map);
        let b = kf(&mut map);
        let c = kf(&mut map);

        let shared = map.create_map_point(Vector3::new(0.0, 0.0, 1.0), [0u8; 32], a);
        map.associate(a, 0, shared);
        map.associate(b, 0, shared);
        let only_c = map.create_map_point(Vector3::new(0.0, 1.0, 1.0), [0u8; 32], b);
        map.associate(b, 1, only_c);
        map.associate(c, 1, only_c);
        let private_a = map.create_map_point(Vector3::new(1.0, 0.0, 1.0), [0u8; 32], a);
        map.associate(a, 2, private_a);

        let local = LocalMap::build(&map, &[Some(private_a), None]);
        assert_eq!(local.reference, Some(a));
        // a observes private_a; b joins through covisibility with a.
        assert_eq!(local.keyframes, vec![a, b]);
        assert_eq!(local.map_points, vec![shared, only_c, private_a]);
    }

    #[test]
    fn test_empty_matches() {
        let map = Map::new();
        let local = LocalMap::build(&map, &[None, None]);
        assert!(local.is_empty());
        assert!(local.reference.is_none());
    }
}
