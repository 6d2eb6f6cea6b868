// klt.rs — Pyramidal Lucas-Kanade optical flow.
//
// Propagates each feature from the previous frame into the current one by
// minimizing the photometric error of a square patch around it, solving
// for a pure 2D translation.
//
// Two formulations share the same coarse-to-fine driver:
//
// 1. FORWARD ADDITIVE:
//    Gradients evaluated at the warped position in the current frame,
//    so the 2×2 Hessian is rebuilt every iteration. More robust to large
//    displacements.
//
// 2. INVERSE COMPOSITIONAL (Baker & Matthews, 2004):
//    Gradients evaluated once on the template in the previous frame, so
//    the Hessian is constant and only the error is recomputed.
//
// Coarse-to-fine: start at the top of the pyramid with zero displacement,
// refine, double the displacement and continue one level down.
//
// A feature is reported Lost when the Hessian is singular (flat or
// edge-only patch) and OutOfBounds when the final position leaves the
// image.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::image::{interpolate_bilinear, Image};
use crate::pyramid::Pyramid;

/// Hessian determinant below which a patch is considered untrackable.
const MIN_DETERMINANT: f32 = 1e-6;

/// Outcome of tracking one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Tracked,
    /// The solver hit a singular Hessian.
    Lost,
    /// The refined position fell outside the image.
    OutOfBounds,
}

/// Lucas-Kanade variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LkMethod {
    ForwardAdditive,
    InverseCompositional,
}

/// Tracking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Patch half-size; the patch is (2·window_size + 1)².
    pub window_size: usize,
    /// Pyramid depth used for coarse-to-fine search.
    pub pyramid_levels: usize,
    /// Gauss-Newton iterations per pyramid level.
    pub max_iterations: usize,
    /// Convergence threshold on the update step, in pixels.
    pub epsilon: f32,
    pub method: LkMethod,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            window_size: 10,
            pyramid_levels: 3,
            max_iterations: 30,
            epsilon: 0.01,
            method: LkMethod::ForwardAdditive,
        }
    }
}

/// A feature position after tracking, with its status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedPoint {
    /// Refined position. Unreliable unless `status == Tracked`.
    pub position: Point2<f32>,
    pub status: TrackStatus,
}

pub struct KltTracker {
    config: TrackerConfig,
}

impl KltTracker {
    pub fn new(config: TrackerConfig) -> Self {
        KltTracker { config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Track `points` from `prev_pyramid` to `curr_pyramid`.
    ///
    /// Returns exactly one result per input point, in input order.
    pub fn track(
        &self,
        prev_pyramid: &Pyramid,
        curr_pyramid: &Pyramid,
        points: &[Point2<f32>],
    ) -> Vec<TrackedPoint> {
        let num_levels = self
            .config
            .pyramid_levels
            .min(prev_pyramid.num_levels())
            .min(curr_pyramid.num_levels())
            .max(1);

        points
            .iter()
            .map(|p| self.track_single(prev_pyramid, curr_pyramid, *p, num_levels))
            .collect()
    }

    fn track_single(
        &self,
        prev_pyr: &Pyramid,
        curr_pyr: &Pyramid,
        point: Point2<f32>,
        num_levels: usize,
    ) -> TrackedPoint {
        let mut dx = 0.0f32;
        let mut dy = 0.0f32;

        for level in (0..num_levels).rev() {
            let scale = 1.0 / (1u32 << level) as f32;
            let px = point.x * scale;
            let py = point.y * scale;
            let prev_img = prev_pyr.level(level);
            let curr_img = curr_pyr.level(level);

            let result = match self.config.method {
                LkMethod::ForwardAdditive => self.lk_forward_additive(prev_img, curr_img, px, py, dx, dy),
                LkMethod::InverseCompositional => {
                    self.lk_inverse_compositional(prev_img, curr_img, px, py, dx, dy)
                }
            };

            match result {
                LkResult::Converged(ndx, ndy) | LkResult::MaxIter(ndx, ndy) => {
                    dx = ndx;
                    dy = ndy;
                }
                LkResult::Singular => {
                    return TrackedPoint {
                        position: Point2::new(point.x + dx / scale, point.y + dy / scale),
                        status: TrackStatus::Lost,
                    };
                }
            }

            if level > 0 {
                dx *= 2.0;
                dy *= 2.0;
            }
        }

        let position = Point2::new(point.x + dx, point.y + dy);
        let w = curr_pyr.level(0).width() as f32;
        let h = curr_pyr.level(0).height() as f32;
        let in_bounds = position.x.is_finite()
            && position.y.is_finite()
            && position.x >= 0.0
            && position.x <= w - 1.0
            && position.y >= 0.0
            && position.y <= h - 1.0;

        TrackedPoint {
            position,
            status: if in_bounds { TrackStatus::Tracked } else { TrackStatus::OutOfBounds },
        }
    }

    /// Forward-additive LK at one level. The Hessian is rebuilt from the
    /// current-frame gradients at every iteration.
    fn lk_forward_additive(
        &self,
        prev_img: &Image<f32>,
        curr_img: &Image<f32>,
        fx: f32,
        fy: f32,
        mut dx: f32,
        mut dy: f32,
    ) -> LkResult {
        let half = self.config.window_size as isize;

        for _ in 0..self.config.max_iterations {
            let (mut h00, mut h01, mut h11) = (0.0f32, 0.0f32, 0.0f32);
            let (mut b0, mut b1) = (0.0f32, 0.0f32);

            for oy in -half..=half {
                for ox in -half..=half {
                    let (ox, oy) = (ox as f32, oy as f32);
                    let t = interpolate_bilinear(prev_img, fx + ox, fy + oy);
                    let wx = fx + dx + ox;
                    let wy = fy + dy + oy;
                    let e = t - interpolate_bilinear(curr_img, wx, wy);

                    let gx = 0.5
                        * (interpolate_bilinear(curr_img, wx + 1.0, wy)
                            - interpolate_bilinear(curr_img, wx - 1.0, wy));
                    let gy = 0.5
                        * (interpolate_bilinear(curr_img, wx, wy + 1.0)
                            - interpolate_bilinear(curr_img, wx, wy - 1.0));

                    h00 += gx * gx;
                    h01 += gx * gy;
                    h11 += gy * gy;
                    b0 += gx * e;
                    b1 += gy * e;
                }
            }

            let det = h00 * h11 - h01 * h01;
            if det.abs() < MIN_DETERMINANT {
                return LkResult::Singular;
            }
            let inv_det = 1.0 / det;
            let step_x = inv_det * (h11 * b0 - h01 * b1);
            let step_y = inv_det * (h00 * b1 - h01 * b0);
            dx += step_x;
            dy += step_y;

            if step_x * step_x + step_y * step_y < self.config.epsilon * self.config.epsilon {
                return LkResult::Converged(dx, dy);
            }
        }
        LkResult::MaxIter(dx, dy)
    }

    /// Inverse-compositional LK at one level. Template gradients and the
    /// inverse Hessian are computed once; iterations only re-sample the
    /// current frame.
    fn lk_inverse_compositional(
        &self,
        prev_img: &Image<f32>,
        curr_img: &Image<f32>,
        fx: f32,
        fy: f32,
        mut dx: f32,
        mut dy: f32,
    ) -> LkResult {
        let half = self.config.window_size as isize;
        let side = 2 * self.config.window_size + 1;

        // (template value, gx, gy) per patch pixel.
        let mut template = Vec::with_capacity(side * side);
        let (mut h00, mut h01, mut h11) = (0.0f32, 0.0f32, 0.0f32);
        for oy in -half..=half {
            for ox in -half..=half {
                let tx = fx + ox as f32;
                let ty = fy + oy as f32;
                let gx = 0.5
                    * (interpolate_bilinear(prev_img, tx + 1.0, ty)
                        - interpolate_bilinear(prev_img, tx - 1.0, ty));
                let gy = 0.5
                    * (interpolate_bilinear(prev_img, tx, ty + 1.0)
                        - interpolate_bilinear(prev_img, tx, ty - 1.0));
                h00 += gx * gx;
                h01 += gx * gy;
                h11 += gy * gy;
                template.push((interpolate_bilinear(prev_img, tx, ty), gx, gy));
            }
        }

        let det = h00 * h11 - h01 * h01;
        if det.abs() < MIN_DETERMINANT {
            return LkResult::Singular;
        }
        let inv_det = 1.0 / det;
        let (ih00, ih01, ih11) = (inv_det * h11, -inv_det * h01, inv_det * h00);

        for _ in 0..self.config.max_iterations {
            let (mut b0, mut b1) = (0.0f32, 0.0f32);
            let mut patch = template.iter();
            for oy in -half..=half {
                for ox in -half..=half {
                    let Some(&(t, gx, gy)) = patch.next() else {
                        break;
                    };
                    let i = interpolate_bilinear(curr_img, fx + dx + ox as f32, fy + dy + oy as f32);
                    let e = t - i;
                    b0 += gx * e;
                    b1 += gy * e;
                }
            }

            // For a pure translation warp the inverse-compositional update
            // reduces to the additive one.
            let step_x = ih00 * b0 + ih01 * b1;
            let step_y = ih01 * b0 + ih11 * b1;
            dx += step_x;
            dy += step_y;

            if step_x * step_x + step_y * step_y < self.config.epsilon * self.config.epsilon {
                return LkResult::Converged(dx, dy);
            }
        }
        LkResult::MaxIter(dx, dy)
    }
}

enum LkResult {
    Converged(f32, f32),
    MaxIter(f32, f32),
    Singular,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_scene(w: usize, h: usize, sq_x: usize, sq_y: usize, size: usize) -> Image<u8> {
        let mut img = Image::filled(w, h, 30u8);
        for y in sq_y..(sq_y + size).min(h) {
            for x in sq_x..(sq_x + size).min(w) {
                img.set(x, y, 200);
            }
        }
        img
    }

    fn tracker(window_size: usize, method: LkMethod) -> KltTracker {
        KltTracker::new(TrackerConfig { window_size, method, ..Default::default() })
    }

    #[test]
    fn test_zero_motion() {
        let img = square_scene(120, 120, 40, 40, 30);
        let pyr = Pyramid::build(&img, 3, 1.0);
        let results = tracker(5, LkMethod::ForwardAdditive).track(&pyr, &pyr, &[Point2::new(41.0, 41.0)]);
        assert_eq!(results[0].status, TrackStatus::Tracked);
        let d = results[0].position - Point2::new(41.0, 41.0);
        assert!(d.norm() < 0.5, "displacement {d:?} should be near zero");
    }

    #[test]
    fn test_known_shift_both_methods() {
        let pyr1 = Pyramid::build(&square_scene(120, 120, 40, 40, 30), 3, 1.0);
        let pyr2 = Pyramid::build(&square_scene(120, 120, 43, 40, 30), 3, 1.0);

        for method in [LkMethod::ForwardAdditive, LkMethod::InverseCompositional] {
            let results = tracker(7, method).track(&pyr1, &pyr2, &[Point2::new(41.0, 41.0)]);
            assert_eq!(results[0].status, TrackStatus::Tracked, "{method:?}");
            let dx = results[0].position.x - 41.0;
            let dy = results[0].position.y - 41.0;
            assert!((dx - 3.0).abs() < 1.5, "{method:?}: dx = {dx}");
            assert!(dy.abs() < 1.5, "{method:?}: dy = {dy}");
        }
    }

    #[test]
    fn test_flat_region_is_lost() {
        let pyr = Pyramid::build(&Image::filled(60, 60, 128u8), 3, 1.0);
        let results = tracker(5, LkMethod::ForwardAdditive).track(&pyr, &pyr, &[Point2::new(30.0, 30.0)]);
        assert_eq!(results[0].status, TrackStatus::Lost);
    }

    #[test]
    fn test_one_result_per_input_in_order() {
        let pyr = Pyramid::build(&square_scene(200, 200, 40, 40, 30), 3, 1.0);
        let points = [Point2::new(41.0, 41.0), Point2::new(150.0, 150.0), Point2::new(69.0, 69.0)];
        let results = tracker(5, LkMethod::ForwardAdditive).track(&pyr, &pyr, &points);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TrackStatus::Tracked);
        assert_eq!(results[1].status, TrackStatus::Lost);
        assert!((results[2].position - points[2]).norm() < 0.5);
    }

    #[test]
    fn test_subpixel_blob_shift() {
        let blob = |cx: f32, cy: f32| {
            let mut img = Image::new(80, 80);
            for y in 0..80 {
                for x in 0..80 {
                    let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                    img.set(x, y, (255.0 * (-0.005 * d2).exp()) as u8);
                }
            }
            img
        };
        let pyr1 = Pyramid::build(&blob(40.0, 40.0), 3, 1.0);
        let pyr2 = Pyramid::build(&blob(41.5, 40.5), 3, 1.0);
        let results = tracker(7, LkMethod::ForwardAdditive).track(&pyr1, &pyr2, &[Point2::new(40.0, 40.0)]);
        assert_eq!(results[0].status, TrackStatus::Tracked);
        let dx = results[0].position.x - 40.0;
        let dy = results[0].position.y - 40.0;
        assert!((dx - 1.5).abs() < 0.5, "dx = {dx}");
        assert!((dy - 0.5).abs() < 0.5, "dy = {dy}");
    }
}
