// pose.rs — Relative camera motion from two-view correspondences.
//
// Pipeline for one frame pair:
//   1. Pixels → normalized coordinates with K⁻¹
//   2. RANSAC essential matrix (five-point minimal samples, 8-point refit)
//   3. Inlier support check
//   4. Parallax check: if a pure rotation already explains the inliers to
//      within `min_parallax_px`, translation is unobservable
//   5. Decompose E into four (R, t) candidates and keep the one that puts
//      the most triangulated inliers in front of both cameras
//
// Geometry convention: a point X₁ in the previous camera maps to
// X₂ = R·X₁ + t in the current camera, and E = [t]×·R. The returned
// `RelativePose` is the motion of the camera itself, expressed in the
// previous camera frame: rotation Rᵀ and unit translation −Rᵀ·t.

use log::debug;
use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::require_positive;
use crate::error::{ConfigError, Degeneracy, OdometryError};
use crate::essential::{estimate_essential_ransac, EssentialSolver, RansacConfig};
use crate::tracker::Correspondence;

/// Minimum correspondences for a relative pose.
pub const MIN_CORRESPONDENCES: usize = 5;

/// Triangulated depths beyond this many baselines count as invalid.
const MAX_DEPTH: f64 = 1e3;

/// Pose estimation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    /// RANSAC inlier threshold in pixels.
    pub threshold_px: f64,
    pub confidence: f64,
    pub max_iterations: usize,
    /// Minimum fraction of correspondences that must be inliers.
    pub min_inlier_ratio: f64,
    /// Median rotation-only residual (pixels) below which the pair is
    /// treated as a pure rotation.
    pub min_parallax_px: f64,
    pub seed: u64,
    pub solver: EssentialSolver,
}

impl Default for PoseConfig {
    fn default() -> Self {
        PoseConfig {
            threshold_px: 1.0,
            confidence: 0.99,
            max_iterations: 1000,
            min_inlier_ratio: 0.25,
            min_parallax_px: 1.0,
            seed: 42,
            solver: EssentialSolver::FivePoint,
        }
    }
}

/// Camera motion between two frames.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePose {
    /// Orientation of the current camera in the previous camera frame.
    pub rotation: Rotation3<f64>,
    /// Direction of travel in the previous camera frame; unit length, or
    /// zero for the identity pose.
    pub translation: Vector3<f64>,
    /// Per-correspondence flag: RANSAC inlier with positive depth.
    pub inlier_mask: Vec<bool>,
}

impl RelativePose {
    pub fn identity() -> Self {
        RelativePose {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
            inlier_mask: Vec::new(),
        }
    }

    pub fn num_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|&&b| b).count()
    }
}

pub struct PoseEstimator {
    config: PoseConfig,
}

impl PoseEstimator {
    pub fn new(config: PoseConfig) -> Self {
        PoseEstimator { config }
    }

    pub fn config(&self) -> &PoseConfig {
        &self.config
    }

    /// Estimate the camera motion from pixel correspondences.
    pub fn estimate(&self, correspondences: &[Correspondence], k: &Matrix3<f64>) -> Result<RelativePose, OdometryError> {
        let n = correspondences.len();
        if n < MIN_CORRESPONDENCES {
            return Err(OdometryError::InsufficientCorrespondences {
                found: n,
                required: MIN_CORRESPONDENCES,
            });
        }

        let k_inv = k.try_inverse().ok_or_else(|| ConfigError::Invalid {
            key: "K".into(),
            value: format!("{k:?}"),
            reason: "calibration matrix is singular".into(),
        })?;
        let focal = 0.5 * (k[(0, 0)] + k[(1, 1)]);
        require_positive("focal length", focal)?;

        let normalized: Vec<Correspondence> = correspondences
            .iter()
            .map(|c| {
                let p1 = k_inv * Vector3::new(c.prev.x, c.prev.y, 1.0);
                let p2 = k_inv * Vector3::new(c.curr.x, c.curr.y, 1.0);
                Correspondence::new((p1.xy() / p1.z).into(), (p2.xy() / p2.z).into())
            })
            .collect();

        let ransac = RansacConfig {
            max_iterations: self.config.max_iterations,
            threshold: (self.config.threshold_px / focal).powi(2),
            confidence: self.config.confidence,
            seed: self.config.seed,
            solver: self.config.solver,
        };
        let essential = estimate_essential_ransac(&normalized, &ransac).ok_or(Degeneracy::NoHypothesis)?;

        let inliers = essential.num_inliers;
        if inliers < MIN_CORRESPONDENCES || essential.inlier_ratio() < self.config.min_inlier_ratio {
            return Err(Degeneracy::LowInlierRatio { inliers, total: n }.into());
        }

        let inlier_corrs: Vec<Correspondence> = normalized
            .iter()
            .zip(&essential.inliers)
            .filter(|(_, &is_inlier)| is_inlier)
            .map(|(c, _)| *c)
            .collect();

        let median_px = rotation_only_residual(&inlier_corrs) * focal;
        if median_px < self.config.min_parallax_px {
            return Err(Degeneracy::InsufficientParallax {
                median_px,
                min_px: self.config.min_parallax_px,
            }
            .into());
        }

        let candidates = decompose_essential(&essential.e).ok_or(Degeneracy::NoHypothesis)?;
        let (r, t, valid) = candidates
            .into_iter()
            .map(|(r, t)| {
                let valid: Vec<bool> = normalized
                    .iter()
                    .zip(&essential.inliers)
                    .map(|(c, &is_inlier)| is_inlier && in_front_of_both(c, &r, &t))
                    .collect();
                (r, t, valid)
            })
            .max_by_key(|(_, _, valid)| valid.iter().filter(|&&b| b).count())
            .ok_or(Degeneracy::NoHypothesis)?;

        let num_valid = valid.iter().filter(|&&b| b).count();
        if 2 * num_valid < inliers {
            return Err(Degeneracy::Chirality { valid: num_valid, inliers }.into());
        }

        debug!(
            "pose: {n} correspondences, {inliers} inliers, {num_valid} in front, parallax {median_px:.2} px, {} ransac iterations",
            essential.iterations
        );

        let r_t = r.transpose();
        Ok(RelativePose {
            rotation: Rotation3::from_matrix_unchecked(r_t),
            translation: (-(r_t * t)).normalize(),
            inlier_mask: valid,
        })
    }
}

/// Four (R, t) decompositions of an essential matrix, t unit length.
fn decompose_essential(e: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;

    // Null direction of Eᵀ is the column of U with the smallest singular value.
    let null = svd.singular_values.imin();
    if null != 2 {
        u.swap_columns(null, 2);
        v_t.swap_rows(null, 2);
    }
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }

    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t: Vector3<f64> = u.column(2).normalize();

    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Least-squares depths of a correspondence along both rays, given
/// X₂ = R·X₁ + t. True if both are positive and finite-range.
fn in_front_of_both(c: &Correspondence, r: &Matrix3<f64>, t: &Vector3<f64>) -> bool {
    let f1 = Vector3::new(c.prev.x, c.prev.y, 1.0);
    let f2 = Vector3::new(c.curr.x, c.curr.y, 1.0);
    let a = r * f1;

    // Minimize |d1·a + t − d2·f2|².
    let p = a.dot(&a);
    let q = a.dot(&f2);
    let s = f2.dot(&f2);
    let det = p * s - q * q;
    if det.abs() < 1e-12 {
        return false;
    }
    let at = a.dot(t);
    let ft = f2.dot(t);
    let d1 = (q * ft - s * at) / det;
    let d2 = (p * ft - q * at) / det;
    d1 > 0.0 && d2 > 0.0 && d1 < MAX_DEPTH && d2 < MAX_DEPTH
}

/// Median normalized residual of the best pure-rotation fit.
///
/// Bearing vectors are aligned with the Kabsch / Horn method (no
/// centering: a rotation about the camera center maps bearings to
/// bearings), then each rotated first-view point is compared with its
/// second-view observation on the normalized image plane.
fn rotation_only_residual(inliers: &[Correspondence]) -> f64 {
    let bearings: Vec<(Vector3<f64>, Vector3<f64>)> = inliers
        .iter()
        .map(|c| {
            (
                Vector3::new(c.prev.x, c.prev.y, 1.0).normalize(),
                Vector3::new(c.curr.x, c.curr.y, 1.0).normalize(),
            )
        })
        .collect();

    let mut h = Matrix3::zeros();
    for (b1, b2) in &bearings {
        h += b1 * b2.transpose();
    }
    let svd = h.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return f64::INFINITY;
    };
    let mut v = v_t.transpose();
    if (v * u.transpose()).determinant() < 0.0 {
        v.column_mut(2).neg_mut();
    }
    let rot = v * u.transpose();

    let mut residuals: Vec<f64> = bearings
        .iter()
        .map(|(b1, b2)| {
            let p = rot * b1;
            if p.z <= 0.0 {
                return f64::INFINITY;
            }
            ((p.xy() / p.z) - (b2.xy() / b2.z)).norm()
        })
        .collect();
    if residuals.is_empty() {
        return f64::INFINITY;
    }
    residuals.sort_by(|a, b| a.total_cmp(b));
    residuals[residuals.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point2;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const F: f64 = 500.0;

    fn k() -> Matrix3<f64> {
        Matrix3::new(F, 0.0, 320.0, 0.0, F, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(p: &Vector3<f64>) -> Point2<f64> {
        Point2::new(F * p.x / p.z + 320.0, F * p.y / p.z + 240.0)
    }

    /// Pixel correspondences for X₂ = R·X₁ + t with uniform pixel noise.
    fn scene(r: &Rotation3<f64>, t: &Vector3<f64>, n: usize, noise_px: f64, seed: u64) -> Vec<Correspondence> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let p1 = Vector3::new(rng.gen_range(-4.0..4.0), rng.gen_range(-3.0..3.0), rng.gen_range(8.0..16.0));
                let p2 = r * p1 + t;
                let mut jitter = || noise_px * (rng.gen::<f64>() - 0.5);
                let a = project(&p1);
                let b = project(&p2);
                Correspondence::new(Point2::new(a.x + jitter(), a.y + jitter()), Point2::new(b.x + jitter(), b.y + jitter()))
            })
            .collect()
    }

    #[test]
    fn test_four_correspondences_are_insufficient() {
        let corrs = scene(&Rotation3::identity(), &Vector3::new(-1.0, 0.0, 0.0), 4, 0.0, 1);
        let err = PoseEstimator::new(PoseConfig::default()).estimate(&corrs, &k()).unwrap_err();
        assert!(matches!(err, OdometryError::InsufficientCorrespondences { found: 4, required: 5 }));
    }

    #[test]
    fn test_recovers_camera_motion() {
        let r = Rotation3::from_euler_angles(0.01, 0.03, -0.02);
        let t = Vector3::new(-0.8, 0.1, 0.05);
        let corrs = scene(&r, &t, 120, 0.5, 3);

        let pose = PoseEstimator::new(PoseConfig::default()).estimate(&corrs, &k()).unwrap();

        let expected_rot = r.inverse();
        let expected_t = -(r.inverse() * t).normalize();
        assert!(pose.rotation.angle_to(&expected_rot) < 2e-3, "rotation error {}", pose.rotation.angle_to(&expected_rot));
        assert!(pose.translation.dot(&expected_t) > 0.995, "translation {:?}", pose.translation);
        assert_relative_eq!(pose.translation.norm(), 1.0, epsilon = 1e-9);
        assert_eq!(pose.inlier_mask.len(), corrs.len());
        assert!(pose.num_inliers() >= 110, "{} inliers", pose.num_inliers());
    }

    #[test]
    fn test_outliers_are_masked() {
        let r = Rotation3::identity();
        let t = Vector3::new(-1.0, 0.0, 0.0);
        let mut corrs = scene(&r, &t, 60, 0.2, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        for _ in 0..15 {
            corrs.push(Correspondence::new(
                Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)),
                Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)),
            ));
        }

        let pose = PoseEstimator::new(PoseConfig::default()).estimate(&corrs, &k()).unwrap();
        let kept_outliers = pose.inlier_mask[60..].iter().filter(|&&b| b).count();
        assert!(kept_outliers <= 3, "{kept_outliers} outliers kept");
        assert!(pose.translation.x > 0.99);
    }

    #[test]
    fn test_pure_rotation_is_degenerate() {
        let r = Rotation3::from_euler_angles(0.0, 0.05, 0.0);
        let corrs = scene(&r, &Vector3::zeros(), 80, 0.3, 7);
        let err = PoseEstimator::new(PoseConfig::default()).estimate(&corrs, &k()).unwrap_err();
        assert!(matches!(err, OdometryError::DegenerateGeometry(_)), "{err}");
    }

    #[test]
    fn test_singular_calibration_is_config_error() {
        let corrs = scene(&Rotation3::identity(), &Vector3::new(-1.0, 0.0, 0.0), 10, 0.0, 2);
        let err = PoseEstimator::new(PoseConfig::default()).estimate(&corrs, &Matrix3::zeros()).unwrap_err();
        assert!(matches!(err, OdometryError::Config(_)));
    }

    #[test]
    fn test_decomposition_contains_true_pose() {
        let r = Rotation3::from_euler_angles(0.1, -0.05, 0.2);
        let t = Vector3::new(0.1, 0.02, -0.03);
        let e = t.cross_matrix() * r.matrix();
        let candidates = decompose_essential(&e).unwrap();
        let found = candidates.iter().any(|(r_est, t_est)| {
            let angle = Rotation3::from_matrix_unchecked(*r_est).angle_to(&r);
            angle < 1e-6 && t_est.dot(&t.normalize()) > 1.0 - 1e-6
        });
        assert!(found);
        for (r_est, _) in &candidates {
            assert_relative_eq!(r_est.determinant(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rotation_only_residual() {
        let r = Rotation3::from_euler_angles(0.02, -0.04, 0.01);
        let rotated = scene(&r, &Vector3::zeros(), 30, 0.0, 11);
        let normalize = |c: &Correspondence| {
            Correspondence::new(
                Point2::new((c.prev.x - 320.0) / F, (c.prev.y - 240.0) / F),
                Point2::new((c.curr.x - 320.0) / F, (c.curr.y - 240.0) / F),
            )
        };
        let rotated: Vec<_> = rotated.iter().map(normalize).collect();
        assert!(rotation_only_residual(&rotated) < 1e-9);

        let translated: Vec<_> = scene(&r, &Vector3::new(-1.0, 0.0, 0.0), 30, 0.0, 11).iter().map(normalize).collect();
        assert!(rotation_only_residual(&translated) * F > 1.0);
    }
}
