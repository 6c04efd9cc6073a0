// convolution.rs — Separable 1D convolution for Image<T>.
//
// A 2D convolution with a separable kernel K = k_col * k_row^T decomposes
// into a horizontal pass followed by a vertical pass, reducing the cost
// from O(k²) to O(2k) per pixel. Both the Gaussian blur of the pyramid and
// the Sobel / central-difference gradients go through here.
//
// The `_into` variants write into caller-owned buffers (see ConvolveScratch)
// so the per-frame path never allocates. Interior pixels, where the kernel
// does not touch the border, use unchecked access; border pixels go through
// `BorderPolicy`.

use crate::image::{Image, Pixel};

/// How samples outside the image are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BorderPolicy {
    /// Replicate the nearest edge pixel (clamp-to-edge).
    #[default]
    Extend,
    /// Treat everything outside the image as zero.
    Zero,
}

impl BorderPolicy {
    /// Map a possibly out-of-range index to an in-range one, or `None` if
    /// the sample contributes zero.
    #[inline]
    fn resolve(self, i: isize, len: usize) -> Option<usize> {
        if i >= 0 && (i as usize) < len {
            return Some(i as usize);
        }
        match self {
            BorderPolicy::Extend => Some(i.clamp(0, len as isize - 1) as usize),
            BorderPolicy::Zero => None,
        }
    }
}

/// Pre-allocated buffers for a separable convolution.
///
/// `output` holds the result of the last `convolve_separable_into` call.
pub struct ConvolveScratch {
    intermediate: Image<f32>,
    pub output: Image<f32>,
}

impl ConvolveScratch {
    /// Create scratch buffers sized for `width × height` inputs.
    pub fn new(width: usize, height: usize) -> Self {
        ConvolveScratch {
            intermediate: Image::new(width, height),
            output: Image::new(width, height),
        }
    }
}

fn check_kernel(kernel: &[f32]) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
}

/// Convolve each row of `src` with a centred 1D kernel, writing into `dst`.
///
/// `dst` is resized in place to the shape of `src`.
pub fn convolve_rows_into<T: Pixel>(
    src: &Image<T>,
    kernel: &[f32],
    border: BorderPolicy,
    dst: &mut Image<f32>,
) {
    check_kernel(kernel);

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    dst.clear_resize(w, h);
    if w == 0 {
        return;
    }

    let border_px = |y: usize, x: usize| -> f32 {
        let mut acc = 0.0f32;
        for (ki, &kv) in kernel.iter().enumerate() {
            let sx = x as isize + ki as isize - half as isize;
            if let Some(sx) = border.resolve(sx, w) {
                acc += src.get(sx, y).to_f32() * kv;
            }
        }
        acc
    };

    for y in 0..h {
        // Left border: x in [0, half)
        for x in 0..half.min(w) {
            let v = border_px(y, x);
            dst.set(x, y, v);
        }

        // Interior: x in [half, w - half)
        if w > 2 * half {
            for x in half..(w - half) {
                let mut acc = 0.0f32;
                // SAFETY: x - half >= 0 and x + half < w.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x + ki - half, y).to_f32() * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }

        // Right border: x in [max(half, w - half), w)
        let right_start = if w > 2 * half { w - half } else { half.min(w) };
        for x in right_start..w {
            let v = border_px(y, x);
            dst.set(x, y, v);
        }
    }
}

/// Convolve each column of `src` with a centred 1D kernel, writing into `dst`.
pub fn convolve_cols_into(
    src: &Image<f32>,
    kernel: &[f32],
    border: BorderPolicy,
    dst: &mut Image<f32>,
) {
    check_kernel(kernel);

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    dst.clear_resize(w, h);
    if h == 0 {
        return;
    }

    let border_px = |y: usize, x: usize| -> f32 {
        let mut acc = 0.0f32;
        for (ki, &kv) in kernel.iter().enumerate() {
            let sy = y as isize + ki as isize - half as isize;
            if let Some(sy) = border.resolve(sy, h) {
                acc += src.get(x, sy) * kv;
            }
        }
        acc
    };

    for y in 0..half.min(h) {
        for x in 0..w {
            let v = border_px(y, x);
            dst.set(x, y, v);
        }
    }

    if h > 2 * half {
        for y in half..(h - half) {
            for x in 0..w {
                let mut acc = 0.0f32;
                // SAFETY: y - half >= 0 and y + half < h.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x, y + ki - half) * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }
    }

    let bottom_start = if h > 2 * half { h - half } else { half.min(h) };
    for y in bottom_start..h {
        for x in 0..w {
            let v = border_px(y, x);
            dst.set(x, y, v);
        }
    }
}

/// Separable 2D convolution into `scratch.output`: rows first, then columns.
///
/// # Panics
/// Panics if either kernel is empty or has even length.
pub fn convolve_separable_into<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
    border: BorderPolicy,
    scratch: &mut ConvolveScratch,
) {
    convolve_rows_into(src, kernel_row, border, &mut scratch.intermediate);
    convolve_cols_into(&scratch.intermediate, kernel_col, border, &mut scratch.output);
}

/// Allocating separable convolution with clamp-to-edge borders.
///
/// Convenient for one-off use and tests; the per-frame code paths use
/// `convolve_separable_into`.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let mut scratch = ConvolveScratch::new(src.width(), src.height());
    convolve_separable_into(src, kernel_row, kernel_col, BorderPolicy::Extend, &mut scratch);
    scratch.output
}

/// Generate a 1D Gaussian kernel with the given half-size and sigma.
///
/// Returns a kernel of length `2 * half_size + 1`, normalized so the
/// coefficients sum to 1.0.
///
/// # Examples
/// ```
/// let k = pyramid_klt::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let len = 2 * half_size + 1;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut kernel: Vec<f32> = (0..len)
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

/// Standard deviation of a Gaussian whose effective support is a kernel of
/// the given radius: `(2r + 1) / 5`.
pub fn gaussian_sigma_for_radius(radius: usize) -> f32 {
    (2 * radius + 1) as f32 / 5.0
}

/// Gaussian smoothing kernel used before an integer downsample by `scale`.
///
/// The kernel radius equals the scale step, so every source pixel that a
/// destination pixel stands for contributes to it. Returns `None` for
/// `scale == 1`, where no smoothing is needed.
pub fn gaussian_kernel_for_scale(scale: usize) -> Option<Vec<f32>> {
    if scale <= 1 {
        return None;
    }
    Some(gaussian_kernel_1d(scale, gaussian_sigma_for_radius(scale)))
}
