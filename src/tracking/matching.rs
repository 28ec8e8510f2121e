//! Descriptor matching between frames, keyframes and map points.
//!
//! All searches compare 256-bit ORB descriptors by Hamming distance and
//! optionally reject matches whose keypoint orientation change disagrees
//! with the dominant rotation of the image pair.

use std::collections::HashSet;

use nalgebra::{Point2, Vector3};

use crate::atlas::map::{KeyFrame, Map, MapPoint, MapPointId};
use crate::geometry::SE3;
use crate::tracking::frame::{CameraModel, Feature, ScalePyramid, descriptor_distance};
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::FeatureVector;

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold used for initialization and triangulation.
pub const TH_LOW: u32 = 50;

const HISTO_LENGTH: usize = 30;

/// Orientation-change histogram used to reject inconsistent matches.
pub struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    pub fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    /// Record a match `idx` whose keypoints have angles `a1` and `a2` (degrees).
    pub fn add(&mut self, a1: f32, a2: f32, idx: usize) {
        let mut rot = a1 - a2;
        if rot < 0.0 {
            rot += 360.0;
        }
        let bin = (rot * HISTO_LENGTH as f32 / 360.0).round() as usize % HISTO_LENGTH;
        self.bins[bin].push(idx);
    }

    /// Matches outside the three dominant bins.
    ///
    /// The second and third bins only count when they hold at least 10% of
    /// the largest one.
    pub fn outliers(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by(|a, b| self.bins[*b].len().cmp(&self.bins[*a].len()));
        let max = self.bins[order[0]].len();
        let keep: HashSet<usize> = order
            .iter()
            .take(3)
            .enumerate()
            .filter(|(rank, bin)| *rank == 0 || self.bins[**bin].len() as f64 >= 0.1 * max as f64)
            .map(|(_, bin)| *bin)
            .collect();

        (0..HISTO_LENGTH)
            .filter(|b| !keep.contains(b))
            .flat_map(|b| self.bins[b].iter().copied())
            .collect()
    }
}

impl Default for RotationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Window search between the initialization reference frame and the current frame.
///
/// Only features detected at the finest pyramid level take part. `prev_matched`
/// holds, per reference feature, the position it was last matched at and is
/// updated in place. Returns per reference feature the index of the matched
/// current feature.
pub fn search_for_initialization(
    f1: &Frame,
    f2: &Frame,
    prev_matched: &mut [Point2<f64>],
    window: f64,
    nn_ratio: f32,
) -> (Vec<Option<usize>>, usize) {
    let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
    let mut matched_dist = vec![u32::MAX; f2.num_features()];
    let mut matches21: Vec<Option<usize>> = vec![None; f2.num_features()];
    let mut n_matches = 0;

    for (i1, feat1) in f1.features.iter().enumerate() {
        if feat1.octave > 0 {
            continue;
        }
        let Some(prev) = prev_matched.get(i1) else {
            continue;
        };
        let candidates = f2.features_in_area(prev.x, prev.y, window, feat1.octave, feat1.octave);
        if candidates.is_empty() {
            continue;
        }

        let d1 = &f1.descriptors[i1];
        let (mut best, mut second, mut best_idx) = (u32::MAX, u32::MAX, None);
        for i2 in candidates {
            let dist = descriptor_distance(d1, &f2.descriptors[i2]);
            if matched_dist[i2] <= dist {
                continue;
            }
            if dist < best {
                second = best;
                best = dist;
                best_idx = Some(i2);
            } else if dist < second {
                second = dist;
            }
        }

        let Some(i2) = best_idx else {
            continue;
        };
        if best > TH_LOW || best as f32 >= second as f32 * nn_ratio {
            continue;
        }
        if let Some(prev_i1) = matches21[i2] {
            matches12[prev_i1] = None;
            n_matches -= 1;
        }
        matches12[i1] = Some(i2);
        matches21[i2] = Some(i1);
        matched_dist[i2] = best;
        n_matches += 1;
    }

    let mut histogram = RotationHistogram::new();
    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = m {
            histogram.add(f1.features[i1].angle, f2.features[*i2].angle, i1);
        }
    }
    for i1 in histogram.outliers() {
        if matches12[i1].take().is_some() {
            n_matches -= 1;
        }
    }

    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = m {
            prev_matched[i1] = f2.features[*i2].pt;
        }
    }

    (matches12, n_matches)
}

/// A map point projected into a camera.
#[derive(Debug, Clone, Copy)]
pub struct FrustumProjection {
    pub px: Point2<f64>,
    pub level: i32,
    /// Cosine between the viewing ray and the point's mean normal.
    pub view_cos: f64,
}

/// Project a map point and check it is inside the camera frustum, inside
/// its scale-invariance range and seen from within 60° of its normal.
pub fn project_in_frustum(
    mp: &MapPoint,
    pose_cw: &SE3,
    camera_center: &Vector3<f64>,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
) -> Option<FrustumProjection> {
    let p_cam = pose_cw.transform_point(&mp.position);
    let px = camera.project(&p_cam)?;
    if !camera.is_in_image(&px) {
        return None;
    }

    let ray = mp.position - camera_center;
    let dist = ray.norm();
    if !mp.is_in_distance_range(dist) {
        return None;
    }
    let view_cos = if mp.normal.norm() > 0.0 {
        ray.dot(&mp.normal) / dist
    } else {
        1.0
    };
    if view_cos < 0.5 {
        return None;
    }

    Some(FrustumProjection {
        px,
        level: mp.predict_scale(dist, pyramid.scale_factor, pyramid.n_levels()),
        view_cos,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectionParams {
    /// Search radius at pyramid level 0, in pixels.
    pub radius: f64,
    /// Enlarge the radius for points seen at an oblique angle.
    pub widen_oblique: bool,
    pub nn_ratio: f32,
}

impl ProjectionParams {
    pub fn local_map(th: f64) -> Self {
        Self {
            radius: th,
            widen_oblique: true,
            nn_ratio: 0.9,
        }
    }

    pub fn motion(radius: f64) -> Self {
        Self {
            radius,
            widen_oblique: false,
            nn_ratio: 1.0,
        }
    }
}

/// Match `candidates` into the unmatched features of `frame` by projection.
///
/// Returns the number of new matches and the map points that were inside the
/// frustum (their visible counters are updated by the caller).
pub fn search_by_projection(
    frame: &mut Frame,
    map: &Map,
    candidates: &[MapPointId],
    pose_cw: &SE3,
    camera: &CameraModel,
    params: &ProjectionParams,
) -> (usize, Vec<MapPointId>) {
    let pyramid = map.pyramid();
    let center = pose_cw.inverse().translation;
    let already: HashSet<MapPointId> = frame.map_point_matches.iter().flatten().copied().collect();

    let mut n_matches = 0;
    let mut visible = Vec::new();

    for mp_id in candidates {
        if already.contains(mp_id) {
            continue;
        }
        let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let Some(proj) = project_in_frustum(mp, pose_cw, &center, camera, pyramid) else {
            continue;
        };
        visible.push(*mp_id);

        let mut r = params.radius * pyramid.scale(proj.level);
        if params.widen_oblique {
            r *= if proj.view_cos > 0.998 { 2.5 } else { 4.0 };
        }

        let area = frame.features_in_area(proj.px.x, proj.px.y, r, proj.level - 1, proj.level);
        if let Some(idx) = best_match(
            &mp.descriptor,
            area.into_iter().filter(|i| frame.map_point_matches[*i].is_none()),
            &frame.features,
            &frame.descriptors,
            params.nn_ratio,
        ) {
            frame.map_point_matches[idx] = Some(*mp_id);
            n_matches += 1;
        }
    }

    (n_matches, visible)
}

fn best_match(
    desc: &[u8; 32],
    candidates: impl Iterator<Item = usize>,
    features: &[Feature],
    descriptors: &[[u8; 32]],
    nn_ratio: f32,
) -> Option<usize> {
    let (mut best, mut second) = (u32::MAX, u32::MAX);
    let (mut best_idx, mut best_level, mut second_level) = (None, -1, -1);
    for idx in candidates {
        let dist = descriptor_distance(desc, &descriptors[idx]);
        if dist < best {
            second = best;
            second_level = best_level;
            best = dist;
            best_level = features[idx].octave;
            best_idx = Some(idx);
        } else if dist < second {
            second = dist;
            second_level = features[idx].octave;
        }
    }
    if best > TH_HIGH {
        return None;
    }
    if best_level == second_level && best as f32 > nn_ratio * second as f32 {
        return None;
    }
    best_idx
}

/// Match the map points of a keyframe into a frame, comparing only features
/// under the same vocabulary node. Used for relocalization.
pub fn search_by_bow(
    kf: &KeyFrame,
    map: &Map,
    frame: &Frame,
    frame_fv: &FeatureVector,
    nn_ratio: f32,
) -> Vec<Option<MapPointId>> {
    let mut matches: Vec<Option<MapPointId>> = vec![None; frame.num_features()];
    let mut histogram = RotationHistogram::new();

    for (node, kf_indices) in kf.feature_vector() {
        let Some(frame_indices) = frame_fv.get(node) else {
            continue;
        };
        for &kf_idx in kf_indices {
            let Some(mp_id) = kf.get_map_point(kf_idx) else {
                continue;
            };
            if !map.get_map_point(mp_id).is_some_and(|mp| !mp.is_bad) {
                continue;
            }
            let d_kf = &kf.descriptors[kf_idx];

            let (mut best, mut second, mut best_idx) = (u32::MAX, u32::MAX, None);
            for &f_idx in frame_indices {
                if matches[f_idx].is_some() {
                    continue;
                }
                let dist = descriptor_distance(d_kf, &frame.descriptors[f_idx]);
                if dist < best {
                    second = best;
                    best = dist;
                    best_idx = Some(f_idx);
                } else if dist < second {
                    second = dist;
                }
            }

            if let Some(f_idx) = best_idx {
                if best <= TH_LOW && (best as f32) < nn_ratio * second as f32 {
                    matches[f_idx] = Some(mp_id);
                    histogram.add(kf.features[kf_idx].angle, frame.features[f_idx].angle, f_idx);
                }
            }
        }
    }

    for f_idx in histogram.outliers() {
        matches[f_idx] = None;
    }
    matches
}
