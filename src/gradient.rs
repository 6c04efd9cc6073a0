// gradient.rs — Per-layer image derivatives for the KLT tracker.
//
// Two separable providers are built in:
//
//   Sobel (normalized):
//     Ix: row [-0.5, 0, 0.5],  col [0.25, 0.5, 0.25]
//     Iy: row [0.25, 0.5, 0.25], col [-0.5, 0, 0.5]
//   Central difference:
//     Ix: row [-0.5, 0, 0.5],  col [1]
//     Iy: row [1],             col [-0.5, 0, 0.5]
//
// Both are normalized so a unit ramp f(x) = x yields Ix = 1, which keeps
// the tracker's determinant and residual thresholds independent of the
// choice of operator.
//
// GradientPyramid holds one (Ix, Iy) pair per pyramid layer and refreshes
// them in place, so the per-frame path never allocates once shapes settle.

use crate::convolution::{convolve_cols_into, convolve_rows_into, BorderPolicy};
use crate::error::KltError;
use crate::image::{Image, Pixel};
use crate::pyramid::ImagePyramid;

const DERIV: [f32; 3] = [-0.5, 0.0, 0.5];
const SOBEL_SMOOTH: [f32; 3] = [0.25, 0.5, 0.25];
const IDENTITY: [f32; 1] = [1.0];

/// Computes aligned horizontal and vertical derivative images.
///
/// Implementations may keep scratch buffers, hence `&mut self`. `dx` and
/// `dy` are resized in place to the shape of `image`.
pub trait GradientProvider {
    fn process<T: Pixel>(&mut self, image: &Image<T>, dx: &mut Image<f32>, dy: &mut Image<f32>);
}

/// Separable derivative filter: a derivative kernel along one axis and a
/// smoothing kernel along the other.
struct SeparableDerivative {
    smooth: &'static [f32],
    border: BorderPolicy,
    intermediate: Image<f32>,
}

impl SeparableDerivative {
    fn new(smooth: &'static [f32], border: BorderPolicy) -> Self {
        SeparableDerivative {
            smooth,
            border,
            intermediate: Image::new(0, 0),
        }
    }

    fn process<T: Pixel>(&mut self, image: &Image<T>, dx: &mut Image<f32>, dy: &mut Image<f32>) {
        // Ix: derivative along rows, smooth along columns.
        convolve_rows_into(image, &DERIV, self.border, &mut self.intermediate);
        convolve_cols_into(&self.intermediate, self.smooth, self.border, dx);

        // Iy: smooth along rows, derivative along columns.
        convolve_rows_into(image, self.smooth, self.border, &mut self.intermediate);
        convolve_cols_into(&self.intermediate, &DERIV, self.border, dy);
    }
}

/// Normalized 3×3 Sobel operator.
pub struct SobelGradient {
    inner: SeparableDerivative,
}

impl SobelGradient {
    pub fn new(border: BorderPolicy) -> Self {
        SobelGradient {
            inner: SeparableDerivative::new(&SOBEL_SMOOTH, border),
        }
    }

    pub fn border(&self) -> BorderPolicy {
        self.inner.border
    }
}

impl Default for SobelGradient {
    fn default() -> Self {
        Self::new(BorderPolicy::Extend)
    }
}

impl GradientProvider for SobelGradient {
    fn process<T: Pixel>(&mut self, image: &Image<T>, dx: &mut Image<f32>, dy: &mut Image<f32>) {
        self.inner.process(image, dx, dy);
    }
}

/// Unsmoothed central difference, `(f(x+1) - f(x-1)) / 2`.
pub struct CentralDifference {
    inner: SeparableDerivative,
}

impl CentralDifference {
    pub fn new(border: BorderPolicy) -> Self {
        CentralDifference {
            inner: SeparableDerivative::new(&IDENTITY, border),
        }
    }

    pub fn border(&self) -> BorderPolicy {
        self.inner.border
    }
}

impl Default for CentralDifference {
    fn default() -> Self {
        Self::new(BorderPolicy::Extend)
    }
}

impl GradientProvider for CentralDifference {
    fn process<T: Pixel>(&mut self, image: &Image<T>, dx: &mut Image<f32>, dy: &mut Image<f32>) {
        self.inner.process(image, dx, dy);
    }
}

/// Derivative images of one pyramid layer.
#[derive(Clone)]
pub struct GradientLayer {
    pub dx: Image<f32>,
    pub dy: Image<f32>,
}

/// Derivative images for every layer of an [`ImagePyramid`].
#[derive(Clone, Default)]
pub struct GradientPyramid {
    layers: Vec<GradientLayer>,
    updated: bool,
}

impl GradientPyramid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate derivative buffers matching `pyramid`'s layer shapes.
    pub fn for_pyramid<T: Pixel>(pyramid: &ImagePyramid<T>) -> Self {
        let layers = pyramid
            .layers()
            .map(|l| GradientLayer {
                dx: Image::new(l.width(), l.height()),
                dy: Image::new(l.width(), l.height()),
            })
            .collect();
        GradientPyramid {
            layers,
            updated: false,
        }
    }

    /// Recompute the derivatives of every layer of `pyramid`.
    ///
    /// Fails with `NotUpdated` if the pyramid has not seen a frame yet.
    pub fn update<T: Pixel, P: GradientProvider>(
        &mut self,
        provider: &mut P,
        pyramid: &ImagePyramid<T>,
    ) -> Result<(), KltError> {
        if !pyramid.is_updated() {
            return Err(KltError::NotUpdated);
        }
        let n = pyramid.num_layers();
        self.layers.truncate(n);
        while self.layers.len() < n {
            self.layers.push(GradientLayer {
                dx: Image::new(0, 0),
                dy: Image::new(0, 0),
            });
        }
        for (i, layer) in self.layers.iter_mut().enumerate() {
            provider.process(pyramid.layer(i), &mut layer.dx, &mut layer.dy);
        }
        self.updated = true;
        Ok(())
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Derivative pair of `layer`.
    ///
    /// # Panics
    /// Panics if `layer >= num_layers()`.
    pub fn layer(&self, layer: usize) -> &GradientLayer {
        assert!(
            layer < self.layers.len(),
            "gradient layer {layer} out of range ({} layers)",
            self.layers.len()
        );
        &self.layers[layer]
    }

    pub fn deriv_x(&self, layer: usize) -> &Image<f32> {
        &self.layer(layer).dx
    }

    pub fn deriv_y(&self, layer: usize) -> &Image<f32> {
        &self.layer(layer).dy
    }
}
