// pyramid.rs — Gaussian image pyramid for coarse-to-fine tracking.
//
// Each level is the previous one blurred and then decimated by 2:
//   1. Gaussian blur (separable, from convolution.rs)
//   2. Keep every other pixel in both dimensions
//
// The KLT tracker starts at the coarsest level so that displacements of
// several pixels at full resolution become sub-pixel steps at the top.

use crate::convolution::{convolve_separable, gaussian_kernel_1d};
use crate::image::{Image, Pixel};

/// A Gaussian image pyramid.
///
/// `levels[0]` is the input at full resolution (as f32); `levels[n]` is
/// roughly `(width / 2^n, height / 2^n)`.
pub struct Pyramid {
    pub levels: Vec<Image<f32>>,
}

impl Pyramid {
    /// Build a pyramid with at most `num_levels` levels.
    ///
    /// Construction stops early once a level would be smaller than 2×2,
    /// so tiny images yield fewer levels than requested.
    pub fn build<T: Pixel>(src: &Image<T>, num_levels: usize, sigma: f32) -> Self {
        assert!(num_levels >= 1, "pyramid must have at least 1 level");

        let half_size = (3.0 * sigma).ceil().max(1.0) as usize;
        let kernel = gaussian_kernel_1d(half_size, sigma);

        let mut levels = Vec::with_capacity(num_levels);
        let mut current = src.to_f32();
        for _ in 1..num_levels {
            if current.width() < 4 || current.height() < 4 {
                break;
            }
            let blurred = convolve_separable(&current, &kernel, &kernel);
            let next = downsample_2x(&blurred);
            levels.push(std::mem::replace(&mut current, next));
        }
        levels.push(current);

        Pyramid { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &Image<f32> {
        &self.levels[level]
    }
}

/// Keep pixels with even coordinates: `dst(x, y) = src(2x, 2y)`.
fn downsample_2x(src: &Image<f32>) -> Image<f32> {
    let new_w = src.width() / 2;
    let new_h = src.height() / 2;
    let mut dst = Image::new(new_w, new_h);
    for y in 0..new_h {
        for x in 0..new_w {
            // SAFETY: 2x < width and 2y < height.
            unsafe { dst.set_unchecked(x, y, src.get_unchecked(x * 2, y * 2)) }
        }
    }
    dst
}
