//! Pinhole camera with Brown–Conrady distortion.

use nalgebra::{Matrix3, Point2, Vector3};

/// Iterations used when inverting the distortion model.
const UNDISTORT_ITERATIONS: usize = 10;

/// Intrinsics of a monocular pinhole camera.
///
/// `dist` holds `[k1, k2, p1, p2, k3]` in OpenCV order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub dist: [f64; 5],
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            dist: [0.0; 5],
            width,
            height,
        }
    }

    pub fn with_distortion(mut self, dist: [f64; 5]) -> Self {
        self.dist = dist;
        self
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Camera for images resized by `scale`.
    pub fn scaled(&self, scale: f64) -> Self {
        Self {
            fx: self.fx * scale,
            fy: self.fy * scale,
            cx: self.cx * scale,
            cy: self.cy * scale,
            dist: self.dist,
            width: (self.width as f64 * scale).round() as u32,
            height: (self.height as f64 * scale).round() as u32,
        }
    }

    /// Camera for images resized to exactly `width` x `height`.
    ///
    /// Horizontal and vertical intrinsics follow their own axis ratio.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            dist: self.dist,
            width,
            height,
        }
    }

    pub fn has_distortion(&self) -> bool {
        self.dist.iter().any(|d| *d != 0.0)
    }

    /// Project a point in camera coordinates. Returns `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Point2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Normalized image coordinates (`z = 1`) of an undistorted pixel.
    pub fn unproject(&self, px: &Point2<f64>) -> Vector3<f64> {
        Vector3::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy, 1.0)
    }

    pub fn is_in_image(&self, px: &Point2<f64>) -> bool {
        px.x >= 0.0 && px.y >= 0.0 && px.x < self.width as f64 && px.y < self.height as f64
    }

    /// Apply the distortion model to an ideal pixel.
    pub fn distort_point(&self, px: &Point2<f64>) -> Point2<f64> {
        let x = (px.x - self.cx) / self.fx;
        let y = (px.y - self.cy) / self.fy;
        let (xd, yd) = self.distort_normalized(x, y);
        Point2::new(xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    /// Remove lens distortion from a measured pixel.
    pub fn undistort_point(&self, px: &Point2<f64>) -> Point2<f64> {
        if !self.has_distortion() {
            return *px;
        }
        let xd = (px.x - self.cx) / self.fx;
        let yd = (px.y - self.cy) / self.fy;

        // Fixed-point iteration on the forward model.
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let [k1, k2, p1, p2, k3] = self.dist;
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Point2::new(x * self.fx + self.cx, y * self.fy + self.cy)
    }

    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }
}
