//! PnP (Perspective-n-Point) solver using OpenCV.

use anyhow::Result;
use nalgebra::{Matrix3, Point2, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Point3d};
use opencv::prelude::*;

use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (T_wc).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PnpParams {
    pub iterations: i32,
    /// Maximum reprojection error of an inlier, in pixels.
    pub reprojection_error: f32,
    pub confidence: f64,
}

impl Default for PnpParams {
    fn default() -> Self {
        Self {
            iterations: 100,
            reprojection_error: 5.991_f32.sqrt(),
            confidence: 0.99,
        }
    }
}

/// Solve PnP with RANSAC given 3D-2D correspondences, then refine on the inliers.
///
/// `points2d` are undistorted pixel coordinates. `prior` (T_wc) seeds the
/// solver when given. Returns `None` when fewer than 4 correspondences are
/// supplied or RANSAC finds no consensus.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Point2<f64>],
    camera: &CameraModel,
    prior: Option<&SE3>,
    params: &PnpParams,
) -> Result<Option<PnPResult>> {
    let n = points3d.len().min(points2d.len());
    if n < 4 {
        return Ok(None);
    }

    let pts3d: Vec<Point3d> = points3d[..n]
        .iter()
        .map(|p| Point3d::new(p.x, p.y, p.z))
        .collect();
    let pts2d: Vec<Point2f> = points2d[..n]
        .iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect();
    let obj_points = Mat::from_slice(&pts3d)?.try_clone()?;
    let img_points = Mat::from_slice(&pts2d)?.try_clone()?;

    let camera_matrix = Mat::from_slice_2d(&[
        [camera.fx, 0.0, camera.cx],
        [0.0, camera.fy, camera.cy],
        [0.0, 0.0, 1.0],
    ])?;
    let dist_coeffs = Mat::zeros(1, 5, opencv::core::CV_64F)?.to_mat()?;

    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let mut use_extrinsic_guess = false;

    if let Some(prior_pose) = prior {
        // OpenCV works with T_cw.
        let prior_cw = prior_pose.inverse();
        rvec = rotation_matrix_to_rvec(&prior_cw.rotation_matrix())?;
        tvec = Mat::from_slice(&[
            prior_cw.translation.x,
            prior_cw.translation.y,
            prior_cw.translation.z,
        ])?
        .try_clone()?;
        use_extrinsic_guess = !rvec.empty();
    }

    let mut inliers = Mat::default();
    let found = calib3d::solve_pnp_ransac(
        &obj_points,
        &img_points,
        &camera_matrix,
        &dist_coeffs,
        &mut rvec,
        &mut tvec,
        use_extrinsic_guess,
        params.iterations,
        params.reprojection_error,
        params.confidence,
        &mut inliers,
        calib3d::SOLVEPNP_ITERATIVE,
    )?;
    if !found || inliers.empty() {
        return Ok(None);
    }

    let mut inlier_mask = vec![false; n];
    for i in 0..inliers.total() as i32 {
        let idx = *inliers.at::<i32>(i)?;
        if let Some(slot) = inlier_mask.get_mut(idx as usize) {
            *slot = true;
        }
    }

    // Refine on the consensus set.
    let (in3d, in2d): (Vec<Point3d>, Vec<Point2f>) = inlier_mask
        .iter()
        .zip(pts3d.iter().zip(pts2d.iter()))
        .filter(|(keep, _)| **keep)
        .map(|(_, (p3, p2))| (*p3, *p2))
        .unzip();
    if in3d.len() >= 6 {
        calib3d::solve_pnp(
            &Mat::from_slice(&in3d)?.try_clone()?,
            &Mat::from_slice(&in2d)?.try_clone()?,
            &camera_matrix,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            true,
            calib3d::SOLVEPNP_ITERATIVE,
        )?;
    }

    let mut rot_mat = Mat::default();
    calib3d::rodrigues(&rvec, &mut rot_mat, &mut opencv::core::no_array())?;
    let rotation = mat3_to_matrix3(&rot_mat)?;
    let translation = Vector3::new(
        *tvec.at::<f64>(0i32)?,
        *tvec.at::<f64>(1i32)?,
        *tvec.at::<f64>(2i32)?,
    );
    let pose = SE3::from_rt(rotation, translation).inverse();

    // Re-evaluate inliers against the refined pose.
    let pose_cw = pose.inverse();
    let th2 = (params.reprojection_error as f64).powi(2);
    let mut num_inliers = 0;
    for (i, slot) in inlier_mask.iter_mut().enumerate() {
        let ok = camera
            .project(&pose_cw.transform_point(&points3d[i]))
            .is_some_and(|px| (px - points2d[i]).norm_squared() < th2);
        *slot = ok;
        num_inliers += ok as usize;
    }

    Ok(Some(PnPResult {
        pose,
        inlier_mask,
        num_inliers,
    }))
}

/// Convert rotation matrix to Rodrigues vector.
fn rotation_matrix_to_rvec(rot: &Matrix3<f64>) -> Result<Mat> {
    let rows = [
        [rot[(0, 0)], rot[(0, 1)], rot[(0, 2)]],
        [rot[(1, 0)], rot[(1, 1)], rot[(1, 2)]],
        [rot[(2, 0)], rot[(2, 1)], rot[(2, 2)]],
    ];
    let rot_mat = Mat::from_slice_2d(&rows)?;
    let mut rvec = Mat::default();
    calib3d::rodrigues(&rot_mat, &mut rvec, &mut opencv::core::no_array())?;
    Ok(rvec)
}

/// Convert OpenCV 3x3 Mat to nalgebra Matrix3.
fn mat3_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut arr = [0.0f64; 9];
    for (i, v) in arr.iter_mut().enumerate() {
        *v = *mat.at::<f64>(i as i32)?;
    }
    Ok(Matrix3::from_row_slice(&arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_recovers_synthetic_pose() {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let pose_wc = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.05, 0.01),
            translation: Vector3::new(0.1, -0.05, 0.2),
        };
        let pose_cw = pose_wc.inverse();

        let mut points3d = Vec::new();
        let mut points2d = Vec::new();
        for i in 0..60 {
            let x = (i % 10) as f64 * 0.2 - 0.9;
            let y = (i / 10) as f64 * 0.2 - 0.5;
            let z = 3.0 + ((i * 7) % 5) as f64 * 0.3;
            let p = Vector3::new(x, y, z);
            if let Some(px) = camera.project(&pose_cw.transform_point(&p)) {
                points3d.push(p);
                points2d.push(px);
            }
        }
        // A few gross outliers.
        for px in points2d.iter_mut().take(5) {
            px.x += 80.0;
        }

        let result = solve_pnp_ransac(&points3d, &points2d, &camera, None, &PnpParams::default())
            .unwrap()
            .expect("pose");
        assert!((result.pose.translation - pose_wc.translation).norm() < 1e-3);
        assert!(result.pose.rotation.angle_to(&pose_wc.rotation) < 1e-3);
        assert_eq!(result.num_inliers, points3d.len() - 5);
        assert!(!result.inlier_mask[0]);
    }

    #[test]
    fn test_too_few_points() {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let pts3 = vec![Vector3::new(0.0, 0.0, 1.0); 3];
        let pts2 = vec![Point2::new(320.0, 240.0); 3];
        let result = solve_pnp_ransac(&pts3, &pts2, &camera, None, &PnpParams::default()).unwrap();
        assert!(result.is_none());
    }
}
