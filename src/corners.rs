// corners.rs — "Good features to track" corner detector.
//
// Scores every pixel by the structure tensor of its neighborhood and keeps
// the strongest, well-separated responses. Used to seed (and re-seed) the
// feature set that the KLT tracker propagates frame to frame.
//
// Algorithm:
//   1. Sobel gradients Ix, Iy
//   2. Products Ix², Iy², Ix·Iy, each blurred by a Gaussian window
//      (the structure tensor M = [[Sxx, Sxy], [Sxy, Syy]])
//   3. Response: smallest eigenvalue of M (Shi-Tomasi), or
//      det(M) - k·trace(M)² (Harris) when configured
//   4. Keep 3×3 local maxima above quality_level × max response
//   5. Sort strongest first, ties broken by (y, x) so the order is
//      reproducible for the same image
//   6. Greedy min-distance suppression over a bucket grid
//   7. Truncate to max_corners

use serde::{Deserialize, Serialize};

use crate::convolution::{convolve_separable, gaussian_kernel_1d};
use crate::gradient::sobel_xy;
use crate::image::{Image, Pixel};

/// Corner detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Upper bound on returned corners. 0 means unlimited.
    pub max_corners: usize,
    /// Minimum accepted response as a fraction of the strongest response.
    pub quality_level: f32,
    /// Minimum Euclidean distance in pixels between returned corners.
    pub min_distance: f32,
    /// Side of the structure-tensor window (3 → 3×3).
    pub block_size: usize,
    /// Score with the Harris measure instead of the minimum eigenvalue.
    pub use_harris: bool,
    /// Harris sensitivity, only read when `use_harris` is set.
    pub harris_k: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            max_corners: 500,
            quality_level: 0.01,
            min_distance: 10.0,
            block_size: 3,
            use_harris: false,
            harris_k: 0.04,
        }
    }
}

/// A detected corner at integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub x: usize,
    pub y: usize,
    pub score: f32,
}

pub struct CornerDetector {
    config: DetectorConfig,
}

impl CornerDetector {
    pub fn new(config: DetectorConfig) -> Self {
        CornerDetector { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn window_half(&self) -> usize {
        (self.config.block_size / 2).max(1)
    }

    /// Per-pixel corner response. Exposed for inspection and benchmarks.
    pub fn corner_response<T: Pixel>(&self, image: &Image<T>) -> Image<f32> {
        let w = image.width();
        let h = image.height();
        let (ix, iy) = sobel_xy(image);

        let mut ix2 = Image::<f32>::new(w, h);
        let mut iy2 = Image::<f32>::new(w, h);
        let mut ixiy = Image::<f32>::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let gx = ix.get(x, y);
                let gy = iy.get(x, y);
                ix2.set(x, y, gx * gx);
                iy2.set(x, y, gy * gy);
                ixiy.set(x, y, gx * gy);
            }
        }

        let half = self.window_half();
        let kernel = gaussian_kernel_1d(half, half as f32 * 0.5 + 0.5);
        let sxx = convolve_separable(&ix2, &kernel, &kernel);
        let syy = convolve_separable(&iy2, &kernel, &kernel);
        let sxy = convolve_separable(&ixiy, &kernel, &kernel);

        let mut response = Image::<f32>::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let a = sxx.get(x, y);
                let b = syy.get(x, y);
                let c = sxy.get(x, y);
                let r = if self.config.use_harris {
                    let trace = a + b;
                    a * b - c * c - self.config.harris_k * trace * trace
                } else {
                    // λ_min of [[a, c], [c, b]].
                    0.5 * ((a + b) - ((a - b) * (a - b) + 4.0 * c * c).sqrt())
                };
                response.set(x, y, r);
            }
        }
        response
    }

    /// Detect corners, strongest first.
    pub fn detect(&self, image: &Image<u8>) -> Vec<Corner> {
        let w = image.width();
        let h = image.height();
        let border = self.window_half() + 2;
        if w <= 2 * border || h <= 2 * border {
            return Vec::new();
        }

        let response = self.corner_response(image);
        let max_response = response.as_slice().iter().copied().fold(0.0f32, f32::max);
        if max_response <= 0.0 {
            return Vec::new();
        }
        let threshold = self.config.quality_level * max_response;

        let mut candidates = Vec::new();
        for y in border..(h - border) {
            for x in border..(w - border) {
                let r = response.get(x, y);
                if r > threshold && is_local_max(&response, x, y, r) {
                    candidates.push(Corner { x, y, score: r });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });

        self.suppress(candidates, w, h)
    }

    /// Greedy min-distance selection in score order.
    ///
    /// Accepted corners are bucketed into cells of side `min_distance`, so
    /// each candidate only checks the 3×3 neighborhood of its own cell.
    fn suppress(&self, candidates: Vec<Corner>, w: usize, h: usize) -> Vec<Corner> {
        let limit = match self.config.max_corners {
            0 => usize::MAX,
            n => n,
        };
        let min_dist = self.config.min_distance;
        if min_dist < 1.0 {
            return candidates.into_iter().take(limit).collect();
        }

        let cell = min_dist;
        let cols = (w as f32 / cell).ceil() as usize;
        let rows = (h as f32 / cell).ceil() as usize;
        let mut grid: Vec<Vec<(f32, f32)>> = vec![Vec::new(); cols * rows];
        let min_dist_sq = min_dist * min_dist;

        let mut accepted = Vec::new();
        for corner in candidates {
            if accepted.len() >= limit {
                break;
            }
            let (px, py) = (corner.x as f32, corner.y as f32);
            let gx = ((px / cell) as usize).min(cols - 1);
            let gy = ((py / cell) as usize).min(rows - 1);

            let crowded = (gy.saturating_sub(1)..=(gy + 1).min(rows - 1)).any(|cy| {
                (gx.saturating_sub(1)..=(gx + 1).min(cols - 1)).any(|cx| {
                    grid[cy * cols + cx]
                        .iter()
                        .any(|&(ax, ay)| (ax - px).powi(2) + (ay - py).powi(2) < min_dist_sq)
                })
            });
            if crowded {
                continue;
            }

            grid[gy * cols + gx].push((px, py));
            accepted.push(corner);
        }
        accepted
    }
}

fn is_local_max(response: &Image<f32>, x: usize, y: usize, r: f32) -> bool {
    for dy in 0..3 {
        for dx in 0..3 {
            if (dx, dy) != (1, 1) && response.get(x + dx - 1, y + dy - 1) > r {
                return false;
            }
        }
    }
    true
}
