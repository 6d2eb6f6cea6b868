// camera.rs — Pinhole camera model with radial-tangential distortion.
//
// Handles:
// - Validated construction from explicit values or flat key-value config
// - Pixel <-> normalized (bearing) coordinate conversion
// - K matrix construction for geometric verification
// - Point undistortion, forward projection and whole-image undistortion
//
// Distortion follows the five-coefficient Brown-Conrady layout
// [k1, k2, p1, p2, k3]:
//   x_d = x(1 + k1 r² + k2 r⁴ + k3 r⁶) + 2 p1 x y + p2 (r² + 2x²)
//   y_d = y(1 + k1 r² + k2 r⁴ + k3 r⁶) + p1 (r² + 2y²) + 2 p2 x y

use nalgebra::{Matrix3, Point2, Point3};

use crate::config::{parse_optional, parse_required_f64, require_finite, require_positive, KeyValues};
use crate::error::ConfigError;
use crate::image::{interpolate_bilinear, Image};

/// Keys read by `CameraIntrinsics::from_key_values`.
pub const INTRINSIC_KEYS: &[&str] = &["fx", "fy", "cx", "cy", "k1", "k2", "p1", "p2", "k3"];

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 20;

/// Pinhole camera intrinsics. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    /// [k1, k2, p1, p2, k3]
    dist: [f64; 5],
}

impl CameraIntrinsics {
    /// Construct from explicit parameters.
    ///
    /// Fails if any value is non-finite or a focal length is not positive.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, distortion: [f64; 5]) -> Result<Self, ConfigError> {
        require_positive("fx", fx)?;
        require_positive("fy", fy)?;
        require_finite("cx", cx)?;
        require_finite("cy", cy)?;
        for (key, value) in INTRINSIC_KEYS[4..].iter().zip(distortion) {
            require_finite(key, value)?;
        }
        Ok(CameraIntrinsics { fx, fy, cx, cy, dist: distortion })
    }

    /// Pinhole camera without distortion.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, ConfigError> {
        Self::new(fx, fy, cx, cy, [0.0; 5])
    }

    /// Read `fx fy cx cy` (required) and `k1 k2 p1 p2 k3` (default 0).
    pub fn from_key_values(values: &KeyValues) -> Result<Self, ConfigError> {
        let fx = parse_required_f64(values, "fx")?;
        let fy = parse_required_f64(values, "fy")?;
        let cx = parse_required_f64(values, "cx")?;
        let cy = parse_required_f64(values, "cy")?;
        let mut dist = [0.0; 5];
        for (slot, key) in dist.iter_mut().zip(&INTRINSIC_KEYS[4..]) {
            if let Some(v) = parse_optional::<f64>(values, key)? {
                *slot = v;
            }
        }
        Self::new(fx, fy, cx, cy, dist)
    }

    pub fn fx(&self) -> f64 {
        self.fx
    }

    pub fn fy(&self) -> f64 {
        self.fy
    }

    pub fn cx(&self) -> f64 {
        self.cx
    }

    pub fn cy(&self) -> f64 {
        self.cy
    }

    /// The 3×3 calibration matrix K.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Distortion coefficients as [k1, k2, p1, p2, k3].
    pub fn distortion(&self) -> [f64; 5] {
        self.dist
    }

    pub fn has_distortion(&self) -> bool {
        self.dist.iter().any(|&k| k != 0.0)
    }

    /// Pixel → normalized coordinates, K⁻¹ [u, v, 1]ᵀ.
    /// Does NOT undistort; call `undistort_point` first if needed.
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Normalized → pixel coordinates.
    pub fn denormalize(&self, x_n: f64, y_n: f64) -> (f64, f64) {
        (x_n * self.fx + self.cx, y_n * self.fy + self.cy)
    }

    /// Apply the forward distortion model to a normalized point.
    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist;
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Undistort a pixel point.
    ///
    /// Fixed-point iteration on the distortion equations, solving for the
    /// ideal (x, y) that distorts onto the observed point. Returns the
    /// undistorted pixel coordinates; identity when there is no distortion.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let [k1, k2, p1, p2, k3] = self.dist;
        let (x0, y0) = self.normalize(u, v);

        let mut x = x0;
        let mut y = y0;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (x0 - dx) / radial;
            y = (y0 - dy) / radial;
        }
        self.denormalize(x, y)
    }

    /// Project camera-frame 3D points to distorted pixels.
    /// Points at or behind the camera plane are skipped.
    pub fn project_points(&self, points: &[Point3<f64>]) -> Vec<Point2<f64>> {
        points
            .iter()
            .filter(|p| p.z > 0.0)
            .map(|p| {
                let (xd, yd) = self.distort_normalized(p.x / p.z, p.y / p.z);
                let (u, v) = self.denormalize(xd, yd);
                Point2::new(u, v)
            })
            .collect()
    }

    /// Resample an image as seen through an ideal pinhole with the same K.
    ///
    /// Each output pixel is distorted forward and the source sampled
    /// bilinearly there; samples falling outside the source are black.
    pub fn undistort_image(&self, src: &Image<u8>) -> Image<u8> {
        if !self.has_distortion() {
            return src.clone();
        }
        let w = src.width();
        let h = src.height();
        let mut dst = Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let (xn, yn) = self.normalize(x as f64, y as f64);
                let (xd, yd) = self.distort_normalized(xn, yn);
                let (su, sv) = self.denormalize(xd, yd);
                if su < 0.0 || sv < 0.0 || su > (w - 1) as f64 || sv > (h - 1) as f64 {
                    continue;
                }
                let value = interpolate_bilinear(src, su as f32, sv as f32);
                dst.set(x, y, value.round().clamp(0.0, 255.0) as u8);
            }
        }
        dst
    }
}
