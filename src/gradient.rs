// gradient.rs — Sobel image gradients.
//
// Feeds the structure tensor of the corner detector. Both kernels are
// separable:
//   Sobel_x: row [-1, 0, 1], column [1, 2, 1]
//   Sobel_y: row [ 1, 2, 1], column [-1, 0, 1]
//
// Border handling (clamp) is inherited from convolve_separable.

use crate::convolution::convolve_separable;
use crate::image::{Image, Pixel};

const SOBEL_DERIV: [f32; 3] = [-1.0, 0.0, 1.0];
const SOBEL_SMOOTH: [f32; 3] = [1.0, 2.0, 1.0];

/// Horizontal gradient Ix. Positive where intensity increases to the right.
pub fn sobel_x<T: Pixel>(src: &Image<T>) -> Image<f32> {
    convolve_separable(src, &SOBEL_DERIV, &SOBEL_SMOOTH)
}

/// Vertical gradient Iy. Positive where intensity increases downward.
pub fn sobel_y<T: Pixel>(src: &Image<T>) -> Image<f32> {
    convolve_separable(src, &SOBEL_SMOOTH, &SOBEL_DERIV)
}

/// Both gradients, `(Ix, Iy)`.
pub fn sobel_xy<T: Pixel>(src: &Image<T>) -> (Image<f32>, Image<f32>) {
    (sobel_x(src), sobel_y(src))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertical_step_edge() {
        let mut img = Image::<u8>::new(20, 10);
        for y in 0..10 {
            for x in 10..20 {
                img.set(x, y, 100);
            }
        }
        let (ix, iy) = sobel_xy(&img);
        assert!(ix.get(10, 5) > 50.0, "expected strong Ix at the edge");
        assert!(ix.get(5, 5).abs() < 1.0);
        assert!(iy.get(10, 5).abs() < 1e-3);
    }

    #[test]
    fn test_linear_ramp() {
        // f(x, y) = x: the row pass gives 2, the column pass scales by 1+2+1.
        let mut img = Image::<f32>::new(20, 10);
        for y in 0..10 {
            for x in 0..20 {
                img.set(x, y, x as f32);
            }
        }
        let ix = sobel_x(&img);
        let iy = sobel_y(&img);
        for y in 2..8 {
            for x in 2..18 {
                assert!((ix.get(x, y) - 8.0).abs() < 1e-3);
                assert!(iy.get(x, y).abs() < 1e-3);
            }
        }
    }
}
