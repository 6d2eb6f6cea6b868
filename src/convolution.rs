// convolution.rs — Separable 1D convolution for Image<T>.
//
// A 2D kernel K = k_col * k_row^T is applied as a horizontal pass followed
// by a vertical pass, O(2k) per pixel instead of O(k²). Used by the
// pyramid (Gaussian blur), the Sobel gradients and the structure-tensor
// window of the corner detector.
//
// BORDER HANDLING: clamp. Taps that fall outside the image read the
// nearest edge pixel.

use crate::image::{Image, Pixel};

/// Convolve each row of `src` with a centered, odd-length kernel.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    let mut dst = Image::<f32>::new(w, h);
    if w == 0 {
        return dst;
    }

    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            if x >= half && x + half < w {
                // SAFETY: every tap x - half ..= x + half is inside the row.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x + ki - half, y).to_f32() * kv;
                    }
                }
            } else {
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sx = clamp_index(x as isize + ki as isize - half as isize, w);
                    acc += src.get(sx, y).to_f32() * kv;
                }
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Convolve each column of `src` with a centered, odd-length kernel.
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    let mut dst = Image::<f32>::new(w, h);
    if h == 0 {
        return dst;
    }

    for y in 0..h {
        let interior = y >= half && y + half < h;
        for x in 0..w {
            let mut acc = 0.0f32;
            if interior {
                // SAFETY: every tap y - half ..= y + half is inside the column.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x, y + ki - half) * kv;
                    }
                }
            } else {
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sy = clamp_index(y as isize + ki as isize - half as isize, h);
                    acc += src.get(x, sy) * kv;
                }
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Full separable 2D convolution: horizontal pass then vertical pass.
///
/// # Panics
/// Panics if either kernel has even length.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// Normalized 1D Gaussian kernel of length `2 * half_size + 1`.
///
/// # Examples
/// ```
/// let k = mono_vo::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * half_size)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

#[inline]
fn clamp_index(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}
