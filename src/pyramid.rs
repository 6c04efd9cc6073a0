// pyramid.rs — Discrete image pyramid with explicit per-layer scale factors.
//
// Unlike a fixed 2× pyramid, every layer carries its own integer scale
// factor relative to the layer below it (layer 0 relative to the original
// frame). A configuration of [1, 2, 2] gives cumulative scales 1, 2, 4;
// [2, 2] skips full resolution entirely.
//
// Each layer is one record: (buffer, incremental scale, cumulative scale,
// shape). A bottom-layer coordinate maps into layer i by dividing by the
// cumulative scale, and back by multiplying.
//
// Update policy, per frame:
//   layer 0 : alias the frame (Arc clone) when saving the original
//             reference and scale[0] == 1, a plain copy when scale[0] == 1
//             otherwise, else blur + downsample the frame by scale[0].
//   layer i : blur layer i-1 with a Gaussian sized from scale[i], then
//             take every scale[i]-th pixel into layer i's buffer.
//
// All buffers are created by `set_scaling`; `PyramidUpdater::update`
// only writes into them.

use std::sync::Arc;

use crate::convolution::{
    convolve_separable_into, gaussian_kernel_1d, gaussian_kernel_for_scale, BorderPolicy,
    ConvolveScratch,
};
use crate::error::KltError;
use crate::image::{Image, Pixel};

/// Storage behind one pyramid layer.
#[derive(Clone)]
enum LayerBuffer<T: Pixel> {
    /// Layer 0 placeholder until the first frame arrives (aliasing mode).
    Unallocated,
    /// A buffer owned by the pyramid and refilled in place.
    Owned(Image<T>),
    /// The caller's frame, shared without copying.
    Shared(Arc<Image<T>>),
}

/// One resolution level of an [`ImagePyramid`].
#[derive(Clone)]
pub struct PyramidLayer<T: Pixel> {
    buffer: LayerBuffer<T>,
    /// Scale relative to the layer below (or the original frame for layer 0).
    scale: usize,
    /// Product of all scale factors up to and including this layer.
    cumulative: usize,
    width: usize,
    height: usize,
}

impl<T: Pixel> PyramidLayer<T> {
    /// Incremental scale factor of this layer.
    pub fn scale(&self) -> usize {
        self.scale
    }

    /// Cumulative scale factor of this layer relative to the original frame.
    pub fn cumulative_scale(&self) -> usize {
        self.cumulative
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// The layer image, or `None` if layer 0 is still waiting for a frame to alias.
    pub fn image(&self) -> Option<&Image<T>> {
        match &self.buffer {
            LayerBuffer::Unallocated => None,
            LayerBuffer::Owned(img) => Some(img),
            LayerBuffer::Shared(img) => Some(img.as_ref()),
        }
    }

    /// Pre-allocated buffer for writing, creating it for an aliasing layer
    /// that is being switched to owned storage.
    fn owned_mut(&mut self) -> &mut Image<T> {
        if !matches!(self.buffer, LayerBuffer::Owned(_)) {
            self.buffer = LayerBuffer::Owned(Image::new(self.width, self.height));
        }
        match &mut self.buffer {
            LayerBuffer::Owned(img) => img,
            _ => unreachable!("buffer was just made owned"),
        }
    }
}

/// Multi-resolution representation of one frame.
///
/// Generic over the pixel type, so a `u8` pyramid and an `f32` pyramid are
/// distinct types with their own monomorphized sampling code.
#[derive(Clone)]
pub struct ImagePyramid<T: Pixel> {
    bottom_width: usize,
    bottom_height: usize,
    save_original_reference: bool,
    layers: Vec<PyramidLayer<T>>,
    updated: bool,
}

impl<T: Pixel> ImagePyramid<T> {
    /// Create an empty pyramid for frames of `bottom_width × bottom_height`.
    ///
    /// When `save_original_reference` is set and the first scale factor is 1,
    /// layer 0 aliases the caller's frame instead of owning a copy. Only use
    /// it when the caller hands in a fresh frame each time; a frame that is
    /// mutated in place between calls would silently change layer 0.
    pub fn new(bottom_width: usize, bottom_height: usize, save_original_reference: bool) -> Self {
        ImagePyramid {
            bottom_width,
            bottom_height,
            save_original_reference,
            layers: Vec::new(),
            updated: false,
        }
    }

    /// Convenience: `new` followed by `set_scaling`.
    pub fn with_scaling(
        bottom_width: usize,
        bottom_height: usize,
        save_original_reference: bool,
        scale_factors: &[usize],
    ) -> Result<Self, KltError> {
        let mut pyramid = Self::new(bottom_width, bottom_height, save_original_reference);
        pyramid.set_scaling(scale_factors)?;
        Ok(pyramid)
    }

    /// Configure the layers and allocate their buffers.
    ///
    /// Layer `i` is `bottom / Π scale[0..=i]` pixels wide and tall (integer
    /// division). Layer 0 is left unallocated when it will alias the frame.
    pub fn set_scaling(&mut self, scale_factors: &[usize]) -> Result<(), KltError> {
        if scale_factors.is_empty() {
            return Err(KltError::EmptyScaling);
        }
        if let Some((layer, &factor)) = scale_factors.iter().enumerate().find(|(_, &s)| s < 1) {
            return Err(KltError::InvalidScaling { layer, factor });
        }

        let mut layers = Vec::with_capacity(scale_factors.len());
        let mut cumulative = 1usize;
        for (i, &scale) in scale_factors.iter().enumerate() {
            cumulative = cumulative
                .checked_mul(scale)
                .ok_or(KltError::ScalingOverflow { layer: i })?;
            let width = self.bottom_width / cumulative;
            let height = self.bottom_height / cumulative;
            let buffer = if i == 0 && scale == 1 && self.save_original_reference {
                LayerBuffer::Unallocated
            } else {
                LayerBuffer::Owned(Image::new(width, height))
            };
            layers.push(PyramidLayer {
                buffer,
                scale,
                cumulative,
                width,
                height,
            });
        }
        self.layers = layers;
        self.updated = false;
        Ok(())
    }

    /// Number of layers (equal to the number of configured scale factors).
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn bottom_width(&self) -> usize {
        self.bottom_width
    }

    pub fn bottom_height(&self) -> usize {
        self.bottom_height
    }

    /// True if layer 0 aliases the frame when its scale factor is 1.
    pub fn saves_original_reference(&self) -> bool {
        self.save_original_reference
    }

    /// True once a frame has been pushed through a [`PyramidUpdater`].
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Layer record at `layer`.
    ///
    /// # Panics
    /// Panics if `layer >= num_layers()`.
    pub fn layer_info(&self, layer: usize) -> &PyramidLayer<T> {
        assert!(
            layer < self.layers.len(),
            "layer {layer} out of range for a pyramid with {} layers",
            self.layers.len()
        );
        &self.layers[layer]
    }

    /// Iterate over all layer records from finest to coarsest.
    pub fn layers(&self) -> impl Iterator<Item = &PyramidLayer<T>> + '_ {
        self.layers.iter()
    }

    /// Image at `layer`.
    ///
    /// # Panics
    /// Panics if `layer` is out of range or if layer 0 aliases the frame and
    /// no frame has been supplied yet.
    pub fn layer(&self, layer: usize) -> &Image<T> {
        self.layer_info(layer)
            .image()
            .unwrap_or_else(|| panic!("layer {layer} has no image before the first update"))
    }

    /// Cumulative scale of `layer`: the product of the scale factors `0..=layer`.
    ///
    /// # Panics
    /// Panics if `layer >= num_layers()`.
    pub fn scaling_at_layer(&self, layer: usize) -> usize {
        self.layer_info(layer).cumulative
    }

    /// Incremental scale factor of `layer`.
    pub fn scale_factor(&self, layer: usize) -> usize {
        self.layer_info(layer).scale
    }

    /// Width of `layer` in pixels.
    pub fn width(&self, layer: usize) -> usize {
        self.layer_info(layer).width
    }

    /// Height of `layer` in pixels.
    pub fn height(&self, layer: usize) -> usize {
        self.layer_info(layer).height
    }

    /// Map a bottom-layer coordinate into `layer`'s coordinate system.
    #[inline]
    pub fn to_layer(&self, layer: usize, x: f32, y: f32) -> (f32, f32) {
        let s = self.scaling_at_layer(layer) as f32;
        (x / s, y / s)
    }

    /// Map a coordinate in `layer` back to the bottom layer.
    #[inline]
    pub fn to_bottom(&self, layer: usize, x: f32, y: f32) -> (f32, f32) {
        let s = self.scaling_at_layer(layer) as f32;
        (x * s, y * s)
    }

    /// True if `frame` is the very buffer layer 0 is aliasing.
    pub fn is_aliasing(&self, frame: &Arc<Image<T>>) -> bool {
        matches!(
            self.layers.first().map(|l| &l.buffer),
            Some(LayerBuffer::Shared(shared)) if Arc::ptr_eq(shared, frame)
        )
    }
}

/// How the pyramid is built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PyramidConfig {
    /// Incremental scale factor of every layer, finest first.
    pub scale_factors: Vec<usize>,
    /// Alias the caller's frame as layer 0 when `scale_factors[0] == 1`.
    pub save_original_reference: bool,
    /// Fixed Gaussian sigma for every downsampling step. `None` derives the
    /// blur from each layer's scale step.
    pub sigma: Option<f32>,
    /// Border handling of the blur.
    pub border: BorderPolicy,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        PyramidConfig {
            scale_factors: vec![1, 2, 2, 2],
            save_original_reference: true,
            sigma: None,
            border: BorderPolicy::Extend,
        }
    }
}

impl PyramidConfig {
    /// Build an empty pyramid with this configuration for the given frame size.
    pub fn build<T: Pixel>(&self, width: usize, height: usize) -> Result<ImagePyramid<T>, KltError> {
        ImagePyramid::with_scaling(width, height, self.save_original_reference, &self.scale_factors)
    }
}

/// Refreshes an [`ImagePyramid`] from a new frame, reusing all buffers.
///
/// Holds the blur kernels (rebuilt only if the pyramid's scaling changes)
/// and the convolution scratch.
pub struct PyramidUpdater {
    sigma: Option<f32>,
    border: BorderPolicy,
    /// Scale factors the cached kernels were built for.
    kernel_scales: Vec<usize>,
    kernels: Vec<Option<Vec<f32>>>,
    scratch: ConvolveScratch,
}

impl PyramidUpdater {
    /// Updater with scale-derived Gaussian blur, sized for frames of `width × height`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_blur(width, height, None, BorderPolicy::Extend)
    }

    /// Updater with an explicit blur configuration.
    pub fn with_blur(width: usize, height: usize, sigma: Option<f32>, border: BorderPolicy) -> Self {
        if let Some(s) = sigma {
            assert!(s > 0.0, "sigma must be positive");
        }
        PyramidUpdater {
            sigma,
            border,
            kernel_scales: Vec::new(),
            kernels: Vec::new(),
            scratch: ConvolveScratch::new(width, height),
        }
    }

    /// Updater matching a [`PyramidConfig`].
    pub fn from_config(config: &PyramidConfig, width: usize, height: usize) -> Self {
        Self::with_blur(width, height, config.sigma, config.border)
    }

    fn kernel_for(&self, scale: usize) -> Option<Vec<f32>> {
        match self.sigma {
            Some(_) if scale <= 1 => None,
            Some(sigma) => {
                let half = (3.0 * sigma).ceil().max(1.0) as usize;
                Some(gaussian_kernel_1d(half, sigma))
            }
            None => gaussian_kernel_for_scale(scale),
        }
    }

    fn refresh_kernels<T: Pixel>(&mut self, pyramid: &ImagePyramid<T>) {
        let same = self.kernel_scales.len() == pyramid.num_layers()
            && pyramid.layers().zip(&self.kernel_scales).all(|(l, &s)| l.scale == s);
        if same {
            return;
        }
        self.kernel_scales = pyramid.layers().map(|l| l.scale).collect();
        self.kernels = self.kernel_scales.iter().map(|&s| self.kernel_for(s)).collect();
    }

    /// Push a new frame through the pyramid.
    ///
    /// Fails with `ScalingNotSet` if the pyramid has no layers, or with
    /// `ShapeMismatch` if the frame is not the pyramid's bottom shape.
    pub fn update<T: Pixel>(
        &mut self,
        frame: &Arc<Image<T>>,
        pyramid: &mut ImagePyramid<T>,
    ) -> Result<(), KltError> {
        if pyramid.layers.is_empty() {
            return Err(KltError::ScalingNotSet);
        }
        if frame.width() != pyramid.bottom_width || frame.height() != pyramid.bottom_height {
            return Err(KltError::ShapeMismatch {
                expected_width: pyramid.bottom_width,
                expected_height: pyramid.bottom_height,
                width: frame.width(),
                height: frame.height(),
            });
        }
        self.refresh_kernels(pyramid);

        // Layer 0 comes from the frame.
        let alias = pyramid.save_original_reference;
        let first = &mut pyramid.layers[0];
        if first.scale == 1 {
            if alias {
                first.buffer = LayerBuffer::Shared(Arc::clone(frame));
            } else {
                first.owned_mut().copy_from(frame);
            }
        } else {
            self.resample_into(frame, 0, first.owned_mut());
        }

        // Every other layer comes from the one below it.
        for i in 1..pyramid.layers.len() {
            let (below, rest) = pyramid.layers.split_at_mut(i);
            let Some(src) = below[i - 1].image() else {
                return Err(KltError::NotUpdated);
            };
            let scale = rest[0].scale;
            let dst = rest[0].owned_mut();
            if scale == 1 {
                dst.copy_from(src);
            } else {
                self.resample_into(src, i, dst);
            }
        }

        pyramid.updated = true;
        Ok(())
    }

    /// Blur `src` with layer `layer`'s kernel, then keep every `scale`-th pixel.
    fn resample_into<T: Pixel>(&mut self, src: &Image<T>, layer: usize, dst: &mut Image<T>) {
        let step = self.kernel_scales[layer];
        let (w, h) = (src.width() / step, src.height() / step);
        dst.clear_resize(w, h);

        let Some(kernel) = self.kernels[layer].as_deref() else {
            for y in 0..h {
                for x in 0..w {
                    // SAFETY: x*step < src.width() and y*step < src.height().
                    unsafe { dst.set_unchecked(x, y, src.get_unchecked(x * step, y * step)) };
                }
            }
            return;
        };

        convolve_separable_into(src, kernel, kernel, self.border, &mut self.scratch);
        let blurred = &self.scratch.output;
        for y in 0..h {
            for x in 0..w {
                // SAFETY: as above; `blurred` has the shape of `src`.
                unsafe {
                    dst.set_unchecked(x, y, T::from_f32(blurred.get_unchecked(x * step, y * step)));
                }
            }
        }
    }
}
