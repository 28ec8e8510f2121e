//! ORB feature extraction on top of OpenCV.

use anyhow::{Context, Result};
use nalgebra::Point2;
use opencv::core::{KeyPoint, Mat, Ptr, Vector};
use opencv::features2d;
use opencv::prelude::*;

use super::camera::CameraModel;

/// 256-bit ORB descriptor.
pub type Descriptor = [u8; 32];

/// A detected keypoint.
///
/// `raw` is the pixel as measured, `pt` is the undistorted pixel used for geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    pub raw: Point2<f64>,
    pub pt: Point2<f64>,
    pub octave: i32,
    pub angle: f32,
}

impl Feature {
    pub fn at(x: f64, y: f64, octave: i32) -> Self {
        let p = Point2::new(x, y);
        Self {
            raw: p,
            pt: p,
            octave,
            angle: 0.0,
        }
    }
}

/// Features and descriptors of one image, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Hamming distance between two ORB descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Scale pyramid constants shared by extraction, matching and triangulation.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, n_levels: usize) -> Self {
        let n_levels = n_levels.max(1);
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut s = 1.0;
        for _ in 0..n_levels {
            scale_factors.push(s);
            s *= scale_factor;
        }
        let level_sigma2 = scale_factors.iter().map(|s| s * s).collect();
        Self {
            scale_factor,
            scale_factors,
            level_sigma2,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.scale_factors.len()
    }

    /// Scale of an octave, clamped to the pyramid.
    pub fn scale(&self, octave: i32) -> f64 {
        let idx = (octave.max(0) as usize).min(self.scale_factors.len() - 1);
        self.scale_factors[idx]
    }

    pub fn sigma2(&self, octave: i32) -> f64 {
        let idx = (octave.max(0) as usize).min(self.level_sigma2.len() - 1);
        self.level_sigma2[idx]
    }
}

/// ORB extraction parameters (`ORBextractor.*` in the settings file).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbParams {
    pub n_features: i32,
    pub scale_factor: f64,
    pub n_levels: i32,
    pub ini_th_fast: i32,
    pub min_th_fast: i32,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}

/// Detects ORB keypoints and descriptors.
///
/// When the initial FAST threshold yields fewer than half the requested
/// features, detection is repeated with the minimum threshold.
pub struct OrbExtractor {
    orb: Ptr<features2d::ORB>,
    orb_low: Ptr<features2d::ORB>,
    params: OrbParams,
    pyramid: ScalePyramid,
}

impl OrbExtractor {
    pub fn new(params: OrbParams) -> Result<Self> {
        let orb = create_orb(&params, params.ini_th_fast)?;
        let orb_low = create_orb(&params, params.min_th_fast)?;
        Ok(Self {
            orb,
            orb_low,
            params,
            pyramid: ScalePyramid::new(params.scale_factor, params.n_levels as usize),
        })
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    /// Extract features from a single-channel image.
    pub fn extract(&mut self, gray: &Mat, camera: &CameraModel) -> Result<FeatureSet> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .detect_and_compute(gray, &mask, &mut keypoints, &mut descriptors, false)
            .context("ORB detection failed")?;

        if (keypoints.len() as i32) < self.params.n_features / 2 {
            let mut kp_low = Vector::<KeyPoint>::new();
            let mut desc_low = Mat::default();
            self.orb_low
                .detect_and_compute(gray, &mask, &mut kp_low, &mut desc_low, false)
                .context("ORB detection with low FAST threshold failed")?;
            if kp_low.len() > keypoints.len() {
                keypoints = kp_low;
                descriptors = desc_low;
            }
        }

        let mut set = FeatureSet {
            features: Vec::with_capacity(keypoints.len()),
            descriptors: Vec::with_capacity(keypoints.len()),
        };

        for (i, kp) in keypoints.iter().enumerate() {
            let row = descriptors.at_row::<u8>(i as i32)?;
            if row.len() < 32 {
                continue;
            }
            let mut desc = [0u8; 32];
            desc.copy_from_slice(&row[..32]);

            let raw = Point2::new(kp.pt().x as f64, kp.pt().y as f64);
            set.features.push(Feature {
                raw,
                pt: camera.undistort_point(&raw),
                octave: kp.octave(),
                angle: kp.angle(),
            });
            set.descriptors.push(desc);
        }

        Ok(set)
    }
}

fn create_orb(params: &OrbParams, fast_threshold: i32) -> Result<Ptr<features2d::ORB>> {
    let orb = features2d::ORB::create(
        params.n_features,
        params.scale_factor as f32,
        params.n_levels,
        31,
        0,
        2,
        features2d::ORB_ScoreType::HARRIS_SCORE,
        31,
        fast_threshold,
    )?;
    Ok(orb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &b), 0);
        b[0] = 0xFF;
        b[31] = 0x01;
        assert_eq!(descriptor_distance(&a, &b), 9);
    }

    #[test]
    fn test_scale_pyramid() {
        let pyr = ScalePyramid::new(1.2, 8);
        assert_eq!(pyr.n_levels(), 8);
        assert!((pyr.scale(0) - 1.0).abs() < 1e-12);
        assert!((pyr.scale(2) - 1.44).abs() < 1e-12);
        assert!((pyr.sigma2(1) - 1.44).abs() < 1e-12);
        // Out-of-range octaves clamp to the pyramid.
        assert!((pyr.scale(20) - pyr.scale(7)).abs() < 1e-12);
        assert!((pyr.scale(-1) - 1.0).abs() < 1e-12);
    }
}
