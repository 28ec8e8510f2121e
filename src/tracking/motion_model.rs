//! Constant-velocity motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// The velocity is the relative motion between the last two tracked frames,
/// expressed in the previous camera frame, and is re-applied to predict the
/// next pose.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Previous pose (T_wc).
    prev_pose: Option<SE3>,
    /// T_prev_curr of the last update.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model with a new tracked pose.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = Some(prev.inverse().compose(pose));
        }
        self.prev_pose = Some(pose.clone());
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Predict the next pose. Without a velocity the last pose is returned.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose.as_ref()?;
        Some(match &self.velocity {
            Some(v) => prev.compose(v),
            None => prev.clone(),
        })
    }

    /// Forget the velocity but keep the last pose.
    pub fn clear_velocity(&mut self) {
        self.velocity = None;
    }

    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_constant_velocity_prediction() {
        let step = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(0.1, 0.0, 0.0),
        };
        let p0 = SE3::identity();
        let p1 = p0.compose(&step);
        let p2 = p1.compose(&step);

        let mut model = MotionModel::new();
        assert!(model.predict().is_none());
        model.update(&p0);
        assert!(!model.has_velocity());
        model.update(&p1);

        let pred = model.predict().unwrap();
        assert!((pred.translation - p2.translation).norm() < 1e-12);
        assert!(pred.rotation.angle_to(&p2.rotation) < 1e-12);
    }

    #[test]
    fn test_reset() {
        let mut model = MotionModel::new();
        model.update(&SE3::identity());
        model.update(&SE3::identity());
        model.reset();
        assert!(model.predict().is_none());
        assert!(!model.has_velocity());
    }
}
