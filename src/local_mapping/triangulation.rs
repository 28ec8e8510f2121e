//! Multi-frame triangulation with geometric validation.
//!
//! For the new keyframe and each of its neighbors:
//! 1. Find epipolar-constrained matches between unmatched features that fall
//!    under the same vocabulary node
//! 2. Triangulate 3D points with DLT
//! 3. Validate with parallax, depth, reprojection error and scale consistency checks

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::geometry::{SE3, projection_matrix, triangulate};
use crate::tracking::frame::{CameraModel, Feature, ScalePyramid, descriptor_distance};
use crate::tracking::matching::{RotationHistogram, TH_LOW};

/// Configuration for multi-frame triangulation.
pub struct TriangulationConfig {
    /// Number of covisible keyframes to consider.
    pub num_neighbors: usize,
    /// Maximum descriptor distance for matching.
    pub max_descriptor_dist: u32,
    /// Minimum baseline as fraction of the neighbor's median scene depth.
    pub min_baseline_ratio: f64,
    /// Rays with a parallax cosine above this are not triangulated.
    pub max_parallax_cos: f64,
    /// Squared reprojection error bound, scaled by the level variance (chi2 2 DOF).
    pub max_reproj_error: f64,
    /// Squared distance to the epipolar line, scaled by the level variance (chi2 1 DOF).
    pub max_epipolar_error: f64,
    /// Scale ratio tolerance factor.
    pub scale_ratio_factor: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 10,
            max_descriptor_dist: TH_LOW,
            min_baseline_ratio: 0.01,
            max_parallax_cos: 0.9998,
            max_reproj_error: 5.991,
            max_epipolar_error: 3.84,
            scale_ratio_factor: 1.5,
        }
    }
}

/// Result of multi-frame triangulation.
#[derive(Debug, Default)]
pub struct TriangulationResult {
    pub new_points: Vec<MapPointId>,
    pub num_pairs_checked: usize,
    pub num_matches_found: usize,
    pub num_triangulated: usize,
}

/// Geometry of one keyframe needed for matching and validation.
struct View<'a> {
    kf: &'a KeyFrame,
    pose_cw: SE3,
    center: Vector3<f64>,
}

impl<'a> View<'a> {
    fn new(kf: &'a KeyFrame) -> Self {
        Self {
            pose_cw: kf.pose_cw(),
            center: kf.camera_center(),
            kf,
        }
    }
}

/// Triangulate new map points between the current keyframe and its neighbors.
///
/// Neighbors are the best covisible keyframes, topped up with the most
/// recent ones while the covisibility graph is still sparse.
pub fn triangulate_from_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> TriangulationResult {
    let mut result = TriangulationResult::default();

    let neighbor_ids = get_neighbor_keyframes(map, current_kf_id, config.num_neighbors);
    if neighbor_ids.is_empty() {
        return result;
    }

    let pyramid = map.pyramid().clone();

    for neighbor_id in neighbor_ids {
        result.num_pairs_checked += 1;

        // Matching and triangulation only read the map; collect first, then insert.
        let points: Vec<(usize, usize, Vector3<f64>)> = {
            let (Some(current), Some(neighbor)) =
                (map.get_keyframe(current_kf_id), map.get_keyframe(neighbor_id))
            else {
                continue;
            };
            let v1 = View::new(current);
            let v2 = View::new(neighbor);

            let baseline = (v2.center - v1.center).norm();
            if let Some(depth) = map.median_scene_depth(neighbor_id) {
                if baseline / depth < config.min_baseline_ratio {
                    continue;
                }
            }

            let matches = search_for_triangulation(&v1, &v2, camera, &pyramid, config);
            result.num_matches_found += matches.len();

            matches
                .into_iter()
                .filter_map(|(idx1, idx2)| {
                    let p = triangulate_pair(&v1, &v2, idx1, idx2, camera, config)?;
                    validate_triangulation(&p, &v1, &v2, idx1, idx2, camera, &pyramid, config)
                        .then_some((idx1, idx2, p))
                })
                .collect()
        };
        result.num_triangulated += points.len();

        for (idx1, idx2, p_world) in points {
            let Some(descriptor) = map
                .get_keyframe(current_kf_id)
                .and_then(|kf| kf.descriptors.get(idx1).copied())
            else {
                continue;
            };
            let mp_id = map.create_map_point(p_world, descriptor, current_kf_id);
            map.associate(current_kf_id, idx1, mp_id);
            map.associate(neighbor_id, idx2, mp_id);
            map.update_map_point_descriptor(mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            result.new_points.push(mp_id);
        }
    }

    if !result.new_points.is_empty() {
        debug!(
            "[Triangulation] kf={} created {} new points (pairs={}, matches={})",
            current_kf_id,
            result.new_points.len(),
            result.num_pairs_checked,
            result.num_matches_found,
        );
    }

    result
}

/// Get neighbor keyframes for triangulation.
fn get_neighbor_keyframes(map: &Map, current_kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
    let mut neighbors = map.local_keyframes(current_kf_id, n);
    for prev in map.previous_keyframes(current_kf_id, n) {
        if neighbors.len() >= n {
            break;
        }
        if !neighbors.contains(&prev) {
            neighbors.push(prev);
        }
    }
    neighbors.retain(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad));
    neighbors
}

/// Fundamental matrix mapping points of view 1 to epipolar lines in view 2.
fn fundamental_21(v1: &View, v2: &View, camera: &CameraModel) -> Matrix3<f64> {
    let t_21 = v2.pose_cw.compose(&v1.kf.pose);
    let t = t_21.translation;
    let t_skew = Matrix3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0);
    let k_inv = camera.k_matrix().try_inverse().unwrap_or_else(Matrix3::identity);
    k_inv.transpose() * t_skew * t_21.rotation_matrix() * k_inv
}

/// Search for triangulation matches using FeatureVector grouping.
///
/// Only features that are not yet associated with a map point, share a
/// vocabulary node, are far enough from the epipole and lie close to the
/// epipolar line are compared.
fn search_for_triangulation(
    v1: &View,
    v2: &View,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    config: &TriangulationConfig,
) -> Vec<(usize, usize)> {
    let f21 = fundamental_21(v1, v2, camera);

    // Camera 1 center projected into camera 2.
    let c1_in_2 = v2.pose_cw.transform_point(&v1.center);
    let epipole = camera.project(&c1_in_2);

    let mut matched2 = vec![false; v2.kf.num_features()];
    let mut matches12: Vec<Option<usize>> = vec![None; v1.kf.num_features()];
    let mut histogram = RotationHistogram::new();

    for (node_id, indices1) in v1.kf.feature_vector() {
        let Some(indices2) = v2.kf.feature_vector().get(node_id) else {
            continue;
        };

        for &idx1 in indices1 {
            if v1.kf.get_map_point(idx1).is_some() {
                continue;
            }
            let f1 = &v1.kf.features[idx1];
            let d1 = &v1.kf.descriptors[idx1];
            let x1 = Vector3::new(f1.pt.x, f1.pt.y, 1.0);
            let line = f21 * x1;

            let mut best_dist = config.max_descriptor_dist + 1;
            let mut best_idx2: Option<usize> = None;

            for &idx2 in indices2 {
                if matched2[idx2] || v2.kf.get_map_point(idx2).is_some() {
                    continue;
                }
                let dist = descriptor_distance(d1, &v2.kf.descriptors[idx2]);
                if dist > config.max_descriptor_dist || dist >= best_dist {
                    continue;
                }

                let f2 = &v2.kf.features[idx2];
                if let Some(e) = epipole {
                    let (dx, dy) = (e.x - f2.pt.x, e.y - f2.pt.y);
                    if dx * dx + dy * dy < 100.0 * pyramid.scale(f2.octave) {
                        continue;
                    }
                }
                if !check_epipolar_constraint(&line, f2, pyramid, config.max_epipolar_error) {
                    continue;
                }

                best_idx2 = Some(idx2);
                best_dist = dist;
            }

            if let Some(idx2) = best_idx2 {
                matched2[idx2] = true;
                matches12[idx1] = Some(idx2);
                histogram.add(f1.angle, v2.kf.features[idx2].angle, idx1);
            }
        }
    }

    for idx1 in histogram.outliers() {
        matches12[idx1] = None;
    }

    matches12
        .into_iter()
        .enumerate()
        .filter_map(|(idx1, m)| m.map(|idx2| (idx1, idx2)))
        .collect()
}

/// Squared distance from a feature to an epipolar line, against the level variance.
fn check_epipolar_constraint(
    line: &Vector3<f64>,
    f2: &Feature,
    pyramid: &ScalePyramid,
    max_error: f64,
) -> bool {
    let den = line.x * line.x + line.y * line.y;
    if den == 0.0 {
        return false;
    }
    let num = line.x * f2.pt.x + line.y * f2.pt.y + line.z;
    num * num / den < max_error * pyramid.sigma2(f2.octave)
}

/// DLT triangulation of one match, rejecting rays with too little parallax.
fn triangulate_pair(
    v1: &View,
    v2: &View,
    idx1: usize,
    idx2: usize,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> Option<Vector3<f64>> {
    let xn1 = camera.unproject(&v1.kf.features[idx1].pt);
    let xn2 = camera.unproject(&v2.kf.features[idx2].pt);

    let ray1 = v1.kf.pose.rotation * xn1;
    let ray2 = v2.kf.pose.rotation * xn2;
    let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
    if cos_parallax <= 0.0 || cos_parallax >= config.max_parallax_cos {
        return None;
    }

    triangulate(
        &xn1,
        &xn2,
        &projection_matrix(&v1.pose_cw),
        &projection_matrix(&v2.pose_cw),
    )
}

/// Validate a triangulated point: positive depth, reprojection error and
/// scale consistency between the two observations.
#[allow(clippy::too_many_arguments)]
fn validate_triangulation(
    p_world: &Vector3<f64>,
    v1: &View,
    v2: &View,
    idx1: usize,
    idx2: usize,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    config: &TriangulationConfig,
) -> bool {
    if !p_world.iter().all(|v| v.is_finite()) {
        return false;
    }

    for (view, idx) in [(v1, idx1), (v2, idx2)] {
        let p_cam = view.pose_cw.transform_point(p_world);
        if p_cam.z <= 0.0 {
            return false;
        }
        let Some(px) = camera.project(&p_cam) else {
            return false;
        };
        let feat = &view.kf.features[idx];
        let err2 = (px - feat.pt).norm_squared();
        if err2 > config.max_reproj_error * pyramid.sigma2(feat.octave) {
            return false;
        }
    }

    let dist1 = (p_world - v1.center).norm();
    let dist2 = (p_world - v2.center).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return false;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave =
        pyramid.scale(v1.kf.features[idx1].octave) / pyramid.scale(v2.kf.features[idx2].octave);
    let ratio_factor = config.scale_ratio_factor * pyramid.scale_factor;

    !(ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::initializer::tests::synthetic_pair;
    use crate::vocabulary::{BowVector, FeatureVector};

    fn single_node(n: usize) -> FeatureVector {
        let mut fv = FeatureVector::new();
        fv.insert(0, (0..n).collect());
        fv
    }

    /// Map with two keyframes observing the synthetic scene, no map points.
    fn two_keyframe_map(n: usize) -> (Map, KeyFrameId, KeyFrameId, CameraModel) {
        let (f1, f2, camera, pose_21) = synthetic_pair(n);
        let mut map = Map::new();
        let kf1 = map.create_keyframe(0.0, SE3::identity(), f1.features, f1.descriptors, 640.0, 480.0);
        let kf2 = map.create_keyframe(
            0.1,
            pose_21.inverse(),
            f2.features,
            f2.descriptors,
            640.0,
            480.0,
        );
        for id in [kf1, kf2] {
            map.get_keyframe_mut(id)
                .unwrap()
                .set_bow(BowVector::new(), single_node(n));
        }
        (map, kf1, kf2, camera)
    }

    #[test]
    fn test_triangulates_against_previous_keyframe() {
        let (mut map, kf1, kf2, camera) = two_keyframe_map(120);
        let result = triangulate_from_neighbors(&mut map, kf2, &camera, &TriangulationConfig::default());

        assert_eq!(result.num_pairs_checked, 1);
        assert!(result.new_points.len() >= 60, "only {} points", result.new_points.len());
        assert_eq!(map.num_map_points(), result.new_points.len());
        assert_eq!(
            map.get_keyframe(kf1).unwrap().covisibility_weight(kf2),
            result.new_points.len()
        );

        // Points land in front of both cameras.
        for mp in map.map_points() {
            assert!(mp.position.z > 0.0);
            assert_eq!(mp.num_observations(), 2);
        }
    }

    #[test]
    fn test_associated_features_are_skipped() {
        let (mut map, _, kf2, camera) = two_keyframe_map(60);
        let config = TriangulationConfig::default();
        let first = triangulate_from_neighbors(&mut map, kf2, &camera, &config);
        assert!(!first.new_points.is_empty());

        let second = triangulate_from_neighbors(&mut map, kf2, &camera, &config);
        assert!(second.new_points.is_empty());
    }

    #[test]
    fn test_epipolar_line_distance() {
        let pyramid = ScalePyramid::new(1.2, 8);
        // Horizontal line y = 100.
        let line = Vector3::new(0.0, 1.0, -100.0);
        assert!(check_epipolar_constraint(&line, &Feature::at(50.0, 101.0, 0), &pyramid, 3.84));
        assert!(!check_epipolar_constraint(&line, &Feature::at(50.0, 103.0, 0), &pyramid, 3.84));
    }

    #[test]
    fn test_single_keyframe_has_no_neighbors() {
        let (f1, _, camera, _) = synthetic_pair(20);
        let mut map = Map::new();
        let kf = map.create_keyframe(0.0, SE3::identity(), f1.features, f1.descriptors, 640.0, 480.0);
        let result = triangulate_from_neighbors(&mut map, kf, &camera, &TriangulationConfig::default());
        assert_eq!(result.num_pairs_checked, 0);
        assert!(result.new_points.is_empty());
    }
}
