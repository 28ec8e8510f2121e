//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: undistorted features, their
//! descriptors, a spatial grid for radius search and temporary associations to
//! `MapPoint`s. Frames that pass the keyframe decision are promoted to
//! `KeyFrame`s by Local Mapping.

use crate::atlas::map::MapPointId;
use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, Feature, FeatureSet};

/// Spatial grid for O(1) feature lookup, matching C++ ORB-SLAM3.
///
/// The grid divides the image into GRID_COLS × GRID_ROWS cells.
/// Each cell stores indices of features whose keypoints fall within that cell.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Grid cells, row-major: cell[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(features: &[Feature], img_width: f64, img_height: f64) -> Self {
        let grid_element_width_inv = Self::GRID_COLS as f64 / img_width.max(1.0);
        let grid_element_height_inv = Self::GRID_ROWS as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];

        for (idx, f) in features.iter().enumerate() {
            // Undistorted points may fall slightly outside the image; clamp them.
            let cell_x = ((f.pt.x * grid_element_width_inv).max(0.0) as usize)
                .min(Self::GRID_COLS - 1);
            let cell_y = ((f.pt.y * grid_element_height_inv).max(0.0) as usize)
                .min(Self::GRID_ROWS - 1);
            cells[cell_y * Self::GRID_COLS + cell_x].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
        }
    }

    /// Candidate feature indices in the cells overlapping a square of half-size `r`.
    ///
    /// Callers do the exact distance check.
    pub fn cell_candidates(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let min_cx = ((x - r) * self.grid_element_width_inv).floor();
        let max_cx = ((x + r) * self.grid_element_width_inv).ceil();
        let min_cy = ((y - r) * self.grid_element_height_inv).floor();
        let max_cy = ((y + r) * self.grid_element_height_inv).ceil();

        if max_cx < 0.0 || max_cy < 0.0 {
            return Vec::new();
        }
        let min_cx = min_cx.max(0.0) as usize;
        let min_cy = min_cy.max(0.0) as usize;
        let max_cx = (max_cx as usize).min(Self::GRID_COLS - 1);
        let max_cy = (max_cy as usize).min(Self::GRID_ROWS - 1);
        if min_cx > max_cx || min_cy > max_cy {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                candidates.extend(&self.cells[cy * Self::GRID_COLS + cx]);
            }
        }
        candidates
    }
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,
    pub features: Vec<Feature>,
    pub descriptors: Vec<Descriptor>,
    /// map_point_matches[i] = Some(mp_id) if feature i is associated.
    pub map_point_matches: Vec<Option<MapPointId>>,
    /// Camera pose (T_wc) once estimated.
    pub pose: Option<SE3>,
    pub grid: FeatureGrid,
}

impl Frame {
    pub fn new(id: u64, timestamp: f64, set: FeatureSet, img_width: f64, img_height: f64) -> Self {
        let n = set.features.len();
        let grid = FeatureGrid::new(&set.features, img_width, img_height);
        Self {
            id,
            timestamp,
            features: set.features,
            descriptors: set.descriptors,
            map_point_matches: vec![None; n],
            pose: None,
            grid,
        }
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn num_matches(&self) -> usize {
        self.map_point_matches.iter().filter(|m| m.is_some()).count()
    }

    /// Feature indices within radius `r` of `(x, y)`, optionally restricted to
    /// an octave range (negative bounds mean unbounded).
    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: i32,
        max_level: i32,
    ) -> Vec<usize> {
        self.grid
            .cell_candidates(x, y, r)
            .into_iter()
            .filter(|&idx| {
                let f = &self.features[idx];
                let level_ok = (min_level < 0 || f.octave >= min_level)
                    && (max_level < 0 || f.octave <= max_level);
                let dx = f.pt.x - x;
                let dy = f.pt.y - y;
                level_ok && dx.abs() < r && dy.abs() < r
            })
            .collect()
    }

    pub fn clear_matches(&mut self) {
        for m in &mut self.map_point_matches {
            *m = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(features: Vec<Feature>) -> Frame {
        let descriptors = vec![[0u8; 32]; features.len()];
        Frame::new(
            0,
            0.0,
            FeatureSet {
                features,
                descriptors,
            },
            640.0,
            480.0,
        )
    }

    #[test]
    fn test_features_in_area() {
        let frame = frame_with(vec![
            Feature::at(100.0, 100.0, 0),
            Feature::at(105.0, 98.0, 1),
            Feature::at(300.0, 300.0, 0),
        ]);
        let mut found = frame.features_in_area(102.0, 100.0, 10.0, -1, -1);
        found.sort();
        assert_eq!(found, vec![0, 1]);

        let level0 = frame.features_in_area(102.0, 100.0, 10.0, 0, 0);
        assert_eq!(level0, vec![0]);
    }

    #[test]
    fn test_features_outside_image_are_clamped() {
        let frame = frame_with(vec![Feature::at(-3.0, 485.0, 0)]);
        assert_eq!(frame.features_in_area(0.0, 479.0, 8.0, -1, -1), vec![0]);
        assert!(frame.features_in_area(-100.0, -100.0, 5.0, -1, -1).is_empty());
    }
}
