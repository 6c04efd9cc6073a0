// klt.rs — Pyramidal KLT (Kanade-Lucas-Tomasi) feature tracker.
//
// Each feature carries a description per pyramid layer: intensity and
// gradients sampled over a (2r+1)² window when the feature was last
// described. Tracking refines the feature's position in the new frame
// coarse-to-fine:
//
//   for layer = max_layer down to 0:
//     window must be inside the layer, else OutOfBounds
//     repeat up to max_iterations:
//       G = Σ [gx² gx·gy; gx·gy gy²],  e = Σ (T - I) · [gx; gy]
//       det(G) < min_determinant · window_len  → LargeError
//       d = G⁻¹ e, position += d
//       leaving the layer → OutOfBounds
//       |dx|, |dy| < min_position_delta → converged
//     scale the position into the next finer layer
//   Σ (T - I)² > max_per_pixel_error² · window_len → LargeError
//   otherwise Success, and the feature moves to the refined position.
//
// Two formulations of the Newton step are supported:
//
// 1. FORWARD ADDITIVE:
//    gx, gy sampled from the new frame's derivative images at the current
//    estimate. G is rebuilt every iteration; more robust to large motion.
//
// 2. INVERSE COMPOSITIONAL (Baker & Matthews, 2004):
//    gx, gy taken from the stored description, so G is the description's
//    structure matrix and is constant across iterations. Only the residual
//    is recomputed. Cheaper per iteration.
//
// The tracker holds configuration only; `track` takes `&self` and touches
// nothing but the feature passed in, so features can be tracked in
// parallel.

use log::trace;

use crate::feature::PyramidFeature;
use crate::gradient::GradientPyramid;
use crate::image::{interpolate_bilinear, Image, Pixel};
use crate::pyramid::ImagePyramid;

/// Result of tracking one feature into one new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Converged at every layer with an acceptable residual.
    /// The feature's position was updated.
    Success,
    /// The sampling window left a layer. The feature keeps its last
    /// accepted position.
    OutOfBounds,
    /// The structure matrix was too weak or the final residual too large.
    LargeError,
}

/// Lucas-Kanade algorithm variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LkMethod {
    /// Gradients sampled at the current estimate in the new frame.
    #[default]
    ForwardAdditive,
    /// Gradients taken from the stored description.
    InverseCompositional,
}

/// Tracker parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KltConfig {
    /// Window radius `r`; windows are `(2r+1)²` samples.
    pub radius: usize,
    /// Newton iterations per layer.
    pub max_iterations: usize,
    /// Minimum determinant of G per window sample.
    pub min_determinant: f32,
    /// Convergence threshold on each step component, in layer pixels.
    pub min_position_delta: f32,
    /// Maximum RMS intensity residual at layer 0.
    pub max_per_pixel_error: f32,
    pub method: LkMethod,
}

impl Default for KltConfig {
    fn default() -> Self {
        KltConfig {
            radius: 3,
            max_iterations: 30,
            min_determinant: 0.01,
            min_position_delta: 0.001,
            max_per_pixel_error: 10.0,
            method: LkMethod::ForwardAdditive,
        }
    }
}

/// Pyramidal KLT tracker. Stateless apart from its configuration.
#[derive(Debug, Clone, Default)]
pub struct PyramidKltTracker {
    config: KltConfig,
}

/// True if the window of radius `r` centred on (x, y) lies inside a
/// `width × height` layer: `x - r >= 0` and `x + r <= width - 1`, same for y.
#[inline]
fn window_inside(x: f32, y: f32, r: f32, width: usize, height: usize) -> bool {
    x - r >= 0.0 && y - r >= 0.0 && x + r <= width as f32 - 1.0 && y + r <= height as f32 - 1.0
}

/// Sample offsets of the window, row-major, matching the description layout.
#[inline]
fn window_offsets(radius: usize) -> impl Iterator<Item = (f32, f32)> {
    let r = radius as isize;
    (-r..=r).flat_map(move |oy| (-r..=r).map(move |ox| (ox as f32, oy as f32)))
}

impl PyramidKltTracker {
    pub fn new(config: KltConfig) -> Self {
        PyramidKltTracker { config }
    }

    pub fn config(&self) -> &KltConfig {
        &self.config
    }

    /// Capture the feature's description at its current position.
    ///
    /// Layers are described bottom-up until the first layer whose window
    /// does not fit; `max_layer` becomes the last layer that did. Returns
    /// false (with `max_layer = None`) if layer 0 itself does not fit.
    pub fn set_description<T: Pixel>(
        &self,
        feature: &mut PyramidFeature,
        pyramid: &ImagePyramid<T>,
        gradients: &GradientPyramid,
    ) -> bool {
        feature.max_layer = None;
        let radius = feature.radius();
        let r = radius as f32;
        let depth = feature
            .num_layers()
            .min(pyramid.num_layers())
            .min(gradients.num_layers());

        for layer in 0..depth {
            let image = pyramid.layer(layer);
            let (lx, ly) = pyramid.to_layer(layer, feature.x, feature.y);
            if !window_inside(lx, ly, r, image.width(), image.height()) {
                break;
            }
            let grad = gradients.layer(layer);
            let desc = feature.description_mut(layer);

            let (mut gxx, mut gyy, mut gxy) = (0.0f32, 0.0f32, 0.0f32);
            for (k, (ox, oy)) in window_offsets(radius).enumerate() {
                let (sx, sy) = (lx + ox, ly + oy);
                let gx = interpolate_bilinear(&grad.dx, sx, sy);
                let gy = interpolate_bilinear(&grad.dy, sx, sy);
                desc.intensity[k] = interpolate_bilinear(image, sx, sy);
                desc.deriv_x[k] = gx;
                desc.deriv_y[k] = gy;
                gxx += gx * gx;
                gyy += gy * gy;
                gxy += gx * gy;
            }
            desc.gxx = gxx;
            desc.gyy = gyy;
            desc.gxy = gxy;
            feature.max_layer = Some(layer);
        }

        feature.max_layer.is_some()
    }

    /// Track `feature` into the frame held by `pyramid` and `gradients`.
    ///
    /// On `Success` the feature's position is moved to the refined
    /// estimate; on any other outcome it is left untouched. The outcome is
    /// also stored in `feature.last_outcome`.
    pub fn track<T: Pixel>(
        &self,
        feature: &mut PyramidFeature,
        pyramid: &ImagePyramid<T>,
        gradients: &GradientPyramid,
    ) -> TrackOutcome {
        let outcome = match self.refine(feature, pyramid, gradients) {
            Ok((x, y)) => {
                feature.set_position(x, y);
                TrackOutcome::Success
            }
            Err(outcome) => {
                trace!(
                    "feature at ({:.2}, {:.2}) lost: {:?}",
                    feature.x,
                    feature.y,
                    outcome
                );
                outcome
            }
        };
        feature.last_outcome = Some(outcome);
        outcome
    }

    /// Coarse-to-fine refinement. Returns the new bottom-layer position or
    /// the failing outcome.
    fn refine<T: Pixel>(
        &self,
        feature: &PyramidFeature,
        pyramid: &ImagePyramid<T>,
        gradients: &GradientPyramid,
    ) -> Result<(f32, f32), TrackOutcome> {
        let Some(max_layer) = feature.max_layer else {
            return Err(TrackOutcome::OutOfBounds);
        };
        if pyramid.num_layers() == 0 || gradients.num_layers() == 0 {
            return Err(TrackOutcome::OutOfBounds);
        }
        let top = max_layer
            .min(pyramid.num_layers() - 1)
            .min(gradients.num_layers() - 1);

        let radius = feature.radius();
        let r = radius as f32;
        let (mut x, mut y) = pyramid.to_layer(top, feature.x, feature.y);

        for layer in (0..=top).rev() {
            let image = pyramid.layer(layer);
            let grad = gradients.layer(layer);
            let desc = feature.description(layer);
            let (w, h) = (image.width(), image.height());

            if !window_inside(x, y, r, w, h) {
                return Err(TrackOutcome::OutOfBounds);
            }

            let window_len = feature.window_len() as f32;
            let min_det = self.config.min_determinant * window_len;

            // Inverse compositional: G is fixed for the whole layer.
            let fixed_g = match self.config.method {
                LkMethod::InverseCompositional => {
                    if desc.determinant() < min_det {
                        return Err(TrackOutcome::LargeError);
                    }
                    Some((desc.gxx, desc.gyy, desc.gxy))
                }
                LkMethod::ForwardAdditive => None,
            };

            for _iter in 0..self.config.max_iterations {
                let (mut gxx, mut gyy, mut gxy) = (0.0f32, 0.0f32, 0.0f32);
                let (mut ex, mut ey) = (0.0f32, 0.0f32);

                for (k, (ox, oy)) in window_offsets(radius).enumerate() {
                    let (sx, sy) = (x + ox, y + oy);
                    let d = desc.intensity[k] - interpolate_bilinear(image, sx, sy);
                    let (gx, gy) = if fixed_g.is_some() {
                        (desc.deriv_x[k], desc.deriv_y[k])
                    } else {
                        let gx = interpolate_bilinear(&grad.dx, sx, sy);
                        let gy = interpolate_bilinear(&grad.dy, sx, sy);
                        gxx += gx * gx;
                        gyy += gy * gy;
                        gxy += gx * gy;
                        (gx, gy)
                    };
                    ex += d * gx;
                    ey += d * gy;
                }

                if let Some(g) = fixed_g {
                    (gxx, gyy, gxy) = g;
                }
                let det = gxx * gyy - gxy * gxy;
                if det < min_det {
                    return Err(TrackOutcome::LargeError);
                }

                let step_x = (gyy * ex - gxy * ey) / det;
                let step_y = (gxx * ey - gxy * ex) / det;
                x += step_x;
                y += step_y;

                if !window_inside(x, y, r, w, h) {
                    return Err(TrackOutcome::OutOfBounds);
                }
                if step_x.abs() < self.config.min_position_delta
                    && step_y.abs() < self.config.min_position_delta
                {
                    break;
                }
            }

            if layer > 0 {
                let s = pyramid.scale_factor(layer) as f32;
                x *= s;
                y *= s;
            }
        }

        let error = window_residual(pyramid.layer(0), feature, x, y);
        let max_error = self.config.max_per_pixel_error;
        if error > max_error * max_error * feature.window_len() as f32 {
            return Err(TrackOutcome::LargeError);
        }

        Ok(pyramid.to_bottom(0, x, y))
    }
}

/// Σ (T - I)² between the layer-0 description and the window at (x, y).
fn window_residual<T: Pixel>(image: &Image<T>, feature: &PyramidFeature, x: f32, y: f32) -> f32 {
    let desc = feature.description(0);
    window_offsets(feature.radius())
        .enumerate()
        .map(|(k, (ox, oy))| {
            let d = desc.intensity[k] - interpolate_bilinear(image, x + ox, y + oy);
            d * d
        })
        .sum()
}
