//! Two-view reconstruction for monocular map initialization.
//!
//! Estimates the essential matrix between two views from matched pixel
//! coordinates with a RANSAC 8-point solver, decomposes it into the four
//! (R, t) hypotheses and keeps the one that triangulates the most points in
//! front of both cameras with low reprojection error.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, Point2, Vector3, Vector4};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Chi-square 95% threshold for a 2-DoF residual (sigma = 1 px).
const CHI2_2DOF: f64 = 5.991;
/// Chi-square 95% threshold for a 1-DoF residual (sigma = 1 px).
const CHI2_1DOF: f64 = 3.841;

#[derive(Debug, Clone, Copy)]
pub struct TwoViewParams {
    pub ransac_iterations: usize,
    pub min_triangulated: usize,
    /// Minimum parallax in degrees.
    pub min_parallax_deg: f64,
    pub seed: u64,
}

impl Default for TwoViewParams {
    fn default() -> Self {
        Self {
            ransac_iterations: 200,
            min_triangulated: 50,
            min_parallax_deg: 1.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// Transform from the first camera frame to the second (T_c2c1). |t| = 1.
    pub pose_21: SE3,
    /// Triangulated points in the first camera frame, per match.
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_triangulated: usize,
    /// Median parallax of triangulated points, in degrees.
    pub parallax_deg: f64,
}

/// Reconstruct relative motion and structure from matched undistorted pixels.
///
/// Returns `None` when the motion is ambiguous, the parallax is too low, or
/// fewer than `min_triangulated` points survive.
pub fn reconstruct(
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
    camera: &CameraModel,
    params: &TwoViewParams,
) -> Option<TwoViewReconstruction> {
    let n = pts1.len().min(pts2.len());
    if n < 8 {
        return None;
    }

    let x1: Vec<Vector3<f64>> = pts1[..n].iter().map(|p| camera.unproject(p)).collect();
    let x2: Vec<Vector3<f64>> = pts2[..n].iter().map(|p| camera.unproject(p)).collect();
    // Pixel-squared per normalized-squared unit.
    let f2 = camera.fx * camera.fy;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best_inliers: Vec<bool> = Vec::new();
    let mut best_score = 0.0;

    for _ in 0..params.ransac_iterations {
        let idx = sample(&mut rng, n, 8);
        let s1: Vec<Vector3<f64>> = idx.iter().map(|i| x1[i]).collect();
        let s2: Vec<Vector3<f64>> = idx.iter().map(|i| x2[i]).collect();
        let Some(e) = essential_8point(&s1, &s2) else {
            continue;
        };
        let (score, inliers) = score_essential(&e, &x1, &x2, f2);
        if score > best_score {
            best_score = score;
            best_inliers = inliers;
        }
    }

    let num_inliers = best_inliers.iter().filter(|b| **b).count();
    if num_inliers < 8 {
        return None;
    }

    let (in1, in2): (Vec<Vector3<f64>>, Vec<Vector3<f64>>) = best_inliers
        .iter()
        .enumerate()
        .filter(|(_, b)| **b)
        .map(|(i, _)| (x1[i], x2[i]))
        .unzip();
    let e = essential_8point(&in1, &in2)?;
    let (_, inliers) = score_essential(&e, &x1, &x2, f2);

    reconstruct_from_essential(&e, &x1, &x2, &inliers, camera, params)
}

/// Linear 8-point estimate on normalized coordinates, projected onto the
/// essential manifold (singular values 1, 1, 0).
fn essential_8point(x1: &[Vector3<f64>], x2: &[Vector3<f64>]) -> Option<Matrix3<f64>> {
    let n = x1.len();
    // At least 9 rows so the thin SVD exposes the null vector.
    let mut a = DMatrix::<f64>::zeros(n.max(9), 9);
    for (i, (p1, p2)) in x1.iter().zip(x2).enumerate() {
        let (u1, v1, u2, v2) = (p1.x, p1.y, p2.x, p2.y);
        let row = [u2 * u1, u2 * v1, u2, v2 * u1, v2 * v1, v2, u1, v1, 1.0];
        for (j, val) in row.iter().enumerate() {
            a[(i, j)] = *val;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let min_idx = svd.singular_values.imin();
    let e_vec = v_t.row(min_idx);
    let e = Matrix3::new(
        e_vec[0], e_vec[1], e_vec[2], e_vec[3], e_vec[4], e_vec[5], e_vec[6], e_vec[7], e_vec[8],
    );

    let svd_e = e.svd(true, true);
    let (u, v_t) = (svd_e.u?, svd_e.v_t?);
    let mut s = svd_e.singular_values;
    // Force the smallest singular value to zero and equalize the others.
    let min_e = s.imin();
    for i in 0..3 {
        s[i] = if i == min_e { 0.0 } else { 1.0 };
    }
    Some(u * Matrix3::from_diagonal(&s) * v_t)
}

/// Symmetric Sampson-style score: inliers contribute `chi2 - err` for each
/// direction. Errors are converted to squared pixels.
fn score_essential(
    e: &Matrix3<f64>,
    x1: &[Vector3<f64>],
    x2: &[Vector3<f64>],
    f2: f64,
) -> (f64, Vec<bool>) {
    let mut score = 0.0;
    let mut inliers = Vec::with_capacity(x1.len());
    for (p1, p2) in x1.iter().zip(x2) {
        let l2 = e * p1;
        let l1 = e.transpose() * p2;
        let num = p2.dot(&l2);
        let num2 = num * num;

        let d2 = l2.x * l2.x + l2.y * l2.y;
        let d1 = l1.x * l1.x + l1.y * l1.y;
        if d1 <= f64::EPSILON || d2 <= f64::EPSILON {
            inliers.push(false);
            continue;
        }
        let err2 = f2 * num2 / d2;
        let err1 = f2 * num2 / d1;

        let ok = err1 < CHI2_1DOF && err2 < CHI2_1DOF;
        if ok {
            score += (CHI2_2DOF - err1) + (CHI2_2DOF - err2);
        }
        inliers.push(ok);
    }
    (score, inliers)
}

fn reconstruct_from_essential(
    e: &Matrix3<f64>,
    x1: &[Vector3<f64>],
    x2: &[Vector3<f64>],
    inliers: &[bool],
    camera: &CameraModel,
    params: &TwoViewParams,
) -> Option<TwoViewReconstruction> {
    let num_inliers = inliers.iter().filter(|b| **b).count();
    let hypotheses = decompose_essential(e)?;

    let mut results: Vec<(usize, Vec<Option<Vector3<f64>>>, f64, Matrix3<f64>, Vector3<f64>)> =
        hypotheses
            .into_iter()
            .map(|(r, t)| {
                let (good, pts, parallax) = check_rt(&r, &t, x1, x2, inliers, camera);
                (good, pts, parallax, r, t)
            })
            .collect();
    results.sort_by(|a, b| b.0.cmp(&a.0));

    let best_good = results[0].0;
    let similar = results
        .iter()
        .filter(|r| r.0 as f64 > 0.7 * best_good as f64)
        .count();
    let min_good = params
        .min_triangulated
        .max((0.9 * num_inliers as f64) as usize);

    if best_good < min_good || similar > 1 {
        tracing::debug!(best_good, min_good, similar, "Ambiguous two-view motion");
        return None;
    }

    let (good, points, parallax_deg, r, t) = results.swap_remove(0);
    if parallax_deg < params.min_parallax_deg {
        tracing::debug!(parallax_deg, "Insufficient parallax for initialization");
        return None;
    }

    Some(TwoViewReconstruction {
        pose_21: SE3::from_rt(r, t),
        points,
        num_triangulated: good,
        parallax_deg,
    })
}

fn decompose_essential(e: &Matrix3<f64>) -> Option<Vec<(Matrix3<f64>, Vector3<f64>)>> {
    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let min_idx = svd.singular_values.imin();
    let t = u.column(min_idx).normalize();

    // Order the remaining columns so the null direction is last.
    let others: Vec<usize> = (0..3).filter(|i| *i != min_idx).collect();
    let u = Matrix3::from_columns(&[u.column(others[0]), u.column(others[1]), u.column(min_idx)]);
    let v_t = Matrix3::from_rows(&[v_t.row(others[0]), v_t.row(others[1]), v_t.row(min_idx)]);

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }

    Some(vec![(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Triangulate inliers under a hypothesis and count the good points.
fn check_rt(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    x1: &[Vector3<f64>],
    x2: &[Vector3<f64>],
    inliers: &[bool],
    camera: &CameraModel,
) -> (usize, Vec<Option<Vector3<f64>>>, f64) {
    let p1 = Matrix3x4::identity();
    let mut p2 = Matrix3x4::zeros();
    p2.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    p2.fixed_view_mut::<3, 1>(0, 3).copy_from(t);

    let o1 = Vector3::zeros();
    let o2 = -r.transpose() * t;
    // Squared reprojection threshold (2 sigma, sigma = 1 px).
    let th2 = 4.0;

    let mut points = vec![None; x1.len()];
    let mut parallaxes = Vec::new();

    for i in 0..x1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(p3d) = triangulate(&x1[i], &x2[i], &p1, &p2) else {
            continue;
        };
        if !p3d.iter().all(|v| v.is_finite()) {
            continue;
        }

        let n1 = p3d - o1;
        let n2 = p3d - o2;
        let cos_parallax = n1.dot(&n2) / (n1.norm() * n2.norm());

        let p3d_c2 = r * p3d + t;
        if p3d.z <= 0.0 || p3d_c2.z <= 0.0 {
            continue;
        }

        let (Some(px1), Some(px2)) = (camera.project(&p3d), camera.project(&p3d_c2)) else {
            continue;
        };
        let obs1 = Point2::new(x1[i].x * camera.fx + camera.cx, x1[i].y * camera.fy + camera.cy);
        let obs2 = Point2::new(x2[i].x * camera.fx + camera.cx, x2[i].y * camera.fy + camera.cy);
        if (px1 - obs1).norm_squared() > th2 || (px2 - obs2).norm_squared() > th2 {
            continue;
        }

        parallaxes.push(cos_parallax.clamp(-1.0, 1.0).acos().to_degrees());
        points[i] = Some(p3d);
    }

    let parallax = if parallaxes.is_empty() {
        0.0
    } else {
        parallaxes.sort_by(|a, b| a.total_cmp(b));
        parallaxes[parallaxes.len() / 2]
    };
    (parallaxes.len(), points, parallax)
}

/// Linear (DLT) triangulation from two normalized observations.
pub fn triangulate(
    x1: &Vector3<f64>,
    x2: &Vector3<f64>,
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::zeros();
    a.set_row(0, &(x1.x * p1.row(2) - p1.row(0)));
    a.set_row(1, &(x1.y * p1.row(2) - p1.row(1)));
    a.set_row(2, &(x2.x * p2.row(2) - p2.row(0)));
    a.set_row(3, &(x2.y * p2.row(2) - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let min_idx = svd.singular_values.imin();
    let h: Vector4<f64> = v_t.row(min_idx).transpose();
    if h.w.abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w))
}

/// Projection matrix [R | t] of a world-to-camera transform.
pub fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&pose_cw.rotation_matrix());
    p.fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&pose_cw.translation);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use rand::Rng;

    fn synthetic_scene() -> (Vec<Point2<f64>>, Vec<Point2<f64>>, CameraModel, SE3) {
        let camera = CameraModel::new(450.0, 450.0, 320.0, 240.0, 640, 480);
        let pose_21 = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.01, -0.04, 0.02),
            translation: Vector3::new(-0.3, 0.02, 0.01),
        };

        let mut rng = StdRng::seed_from_u64(7);
        let mut pts1 = Vec::new();
        let mut pts2 = Vec::new();
        while pts1.len() < 200 {
            let p = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(3.0..8.0),
            );
            let (Some(a), Some(b)) = (camera.project(&p), camera.project(&pose_21.transform_point(&p)))
            else {
                continue;
            };
            if camera.is_in_image(&a) && camera.is_in_image(&b) {
                pts1.push(a);
                pts2.push(b);
            }
        }
        (pts1, pts2, camera, pose_21)
    }

    #[test]
    fn test_reconstructs_synthetic_motion() {
        let (pts1, mut pts2, camera, truth) = synthetic_scene();
        // Corrupt a handful of matches.
        for p in pts2.iter_mut().take(10) {
            p.y += 40.0;
        }

        let rec = reconstruct(&pts1, &pts2, &camera, &TwoViewParams::default())
            .expect("reconstruction");

        assert!(rec.pose_21.rotation.angle_to(&truth.rotation) < 1e-3);
        let t_dir = truth.translation.normalize();
        assert!((rec.pose_21.translation.normalize() - t_dir).norm() < 1e-2);
        assert!(rec.num_triangulated >= 180);
        assert!(rec.parallax_deg >= 1.0);
        assert!(rec.points[..10].iter().all(|p| p.is_none()));
    }

    #[test]
    fn test_pure_rotation_is_rejected() {
        let camera = CameraModel::new(450.0, 450.0, 320.0, 240.0, 640, 480);
        let rot = UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        let mut pts1 = Vec::new();
        let mut pts2 = Vec::new();
        while pts1.len() < 150 {
            let p = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(3.0..8.0));
            if let (Some(a), Some(b)) = (camera.project(&p), camera.project(&(rot * p))) {
                pts1.push(a);
                pts2.push(b);
            }
        }
        assert!(reconstruct(&pts1, &pts2, &camera, &TwoViewParams::default()).is_none());
    }

    #[test]
    fn test_triangulate_exact() {
        let p = Vector3::new(0.5, -0.2, 4.0);
        let pose_cw = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(-0.5, 0.0, 0.0),
        };
        let p2 = projection_matrix(&pose_cw);
        let x1 = p / p.z;
        let pc2 = pose_cw.transform_point(&p);
        let x2 = pc2 / pc2.z;
        let tri = triangulate(&x1, &x2, &Matrix3x4::identity(), &p2).unwrap();
        assert!((tri - p).norm() < 1e-9);
    }

    #[test]
    fn test_too_few_matches() {
        let camera = CameraModel::new(450.0, 450.0, 320.0, 240.0, 640, 480);
        let pts = vec![Point2::new(1.0, 1.0); 5];
        assert!(reconstruct(&pts, &pts, &camera, &TwoViewParams::default()).is_none());
    }
}
