//! Monocular map initialization from two frames.

use nalgebra::{Point2, Vector3};

use crate::geometry::{SE3, TwoViewParams};
use crate::geometry::two_view;
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::search_for_initialization;
use crate::tracking::tracking_frame::Frame;

/// Features a frame needs to serve as (or pair with) the reference frame.
const MIN_FEATURES: usize = 100;
const MIN_MATCHES: usize = 100;
const SEARCH_WINDOW: f64 = 100.0;
const NN_RATIO: f32 = 0.9;

/// Output of a successful two-view initialization.
#[derive(Debug, Clone)]
pub struct Initialization {
    pub reference: Frame,
    /// Transform from the reference camera to the current camera (T_c2c1).
    pub pose_21: SE3,
    /// (reference feature, current feature, point in reference camera frame).
    pub points: Vec<(usize, usize, Vector3<f64>)>,
}

/// Keeps the reference frame between attempts.
#[derive(Debug, Default)]
pub struct MonocularInitializer {
    reference: Option<Frame>,
    prev_matched: Vec<Point2<f64>>,
    params: TwoViewParams,
}

impl MonocularInitializer {
    pub fn new(params: TwoViewParams) -> Self {
        Self {
            reference: None,
            prev_matched: Vec::new(),
            params,
        }
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.prev_matched.clear();
    }

    /// Feed the next frame. Returns the reconstruction once one succeeds.
    pub fn try_initialize(&mut self, frame: &Frame, camera: &CameraModel) -> Option<Initialization> {
        let Some(reference) = &self.reference else {
            if frame.num_features() > MIN_FEATURES {
                self.prev_matched = frame.features.iter().map(|f| f.pt).collect();
                self.reference = Some(frame.clone());
                tracing::debug!(frame = frame.id, features = frame.num_features(), "Set initialization reference");
            }
            return None;
        };

        if frame.num_features() <= MIN_FEATURES {
            self.reset();
            return None;
        }

        let (matches, n_matches) =
            search_for_initialization(reference, frame, &mut self.prev_matched, SEARCH_WINDOW, NN_RATIO);
        if n_matches < MIN_MATCHES {
            tracing::debug!(n_matches, "Too few initialization matches, dropping reference");
            self.reset();
            return None;
        }

        let pairs: Vec<(usize, usize)> = matches
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        let pts1: Vec<Point2<f64>> = pairs.iter().map(|(i1, _)| reference.features[*i1].pt).collect();
        let pts2: Vec<Point2<f64>> = pairs.iter().map(|(_, i2)| frame.features[*i2].pt).collect();

        let rec = two_view::reconstruct(&pts1, &pts2, camera, &self.params)?;
        tracing::info!(
            matches = n_matches,
            triangulated = rec.num_triangulated,
            parallax_deg = rec.parallax_deg,
            "Two-view initialization succeeded"
        );

        let points = pairs
            .iter()
            .zip(rec.points.iter())
            .filter_map(|((i1, i2), p)| p.map(|p| (*i1, *i2, p)))
            .collect();
        let reference = self.reference.take()?;
        self.prev_matched.clear();

        Some(Initialization {
            reference,
            pose_21: rec.pose_21,
            points,
        })
    }
}
