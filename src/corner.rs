// corner.rs — Corner detection for feature replenishment.
//
// The detector works on layer 0 of the pyramid and reuses the derivative
// images the tracker needs anyway:
//
//   1. Products Ix², Iy², Ix·Iy of the layer-0 derivatives
//   2. Box-sum each product over a (2r+1)² window → structure tensor M
//   3. Response per pixel:
//        Shi-Tomasi: λ_min(M) = (a+c)/2 - sqrt(((a-c)/2)² + b²)
//        Harris:     det(M) - k·trace(M)²
//   4. Keep local maxima above the threshold
//   5. Greedy pass, strongest first: drop candidates within `nms_radius`
//      of an accepted one or within `exclude_radius` of an excluded
//      position, stop at `max_count`
//
// Candidates are reported in bottom-layer coordinates. Pixels closer than
// `r` to the border, whose window would be incomplete, never respond.

use log::debug;

use crate::convolution::{convolve_separable_into, BorderPolicy, ConvolveScratch};
use crate::gradient::GradientPyramid;
use crate::image::{Image, Pixel};
use crate::pyramid::ImagePyramid;

/// A detected corner in bottom-layer coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: f32,
    pub y: f32,
    /// Corner response. Higher is stronger.
    pub score: f32,
}

/// Finds new features to track.
pub trait Detector {
    /// Clear `out` and fill it with at most `max_count` candidates in
    /// bottom-layer coordinates, strongest first. Candidates within
    /// `exclude_radius` of any position in `excluded` are not reported.
    fn detect<T: Pixel>(
        &mut self,
        pyramid: &ImagePyramid<T>,
        gradients: &GradientPyramid,
        excluded: &[(f32, f32)],
        exclude_radius: f32,
        max_count: usize,
        out: &mut Vec<Candidate>,
    );
}

/// Corner response function.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CornerScore {
    /// Smallest eigenvalue of the structure tensor.
    #[default]
    ShiTomasi,
    /// `det(M) - k·trace(M)²`. Typical k: 0.04–0.06.
    Harris { k: f32 },
}

/// Corner detector parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CornerDetectorConfig {
    pub score: CornerScore,
    /// Half-size of the structure-tensor window.
    pub radius: usize,
    /// Minimum response for a pixel to be a candidate.
    pub threshold: f32,
    /// Minimum distance between two reported candidates, in bottom pixels.
    pub nms_radius: f32,
}

impl Default for CornerDetectorConfig {
    fn default() -> Self {
        CornerDetectorConfig {
            score: CornerScore::ShiTomasi,
            radius: 2,
            threshold: 1.0,
            nms_radius: 3.0,
        }
    }
}

/// Shi-Tomasi / Harris detector over the layer-0 derivatives.
pub struct CornerDetector {
    config: CornerDetectorConfig,
    box_kernel: Vec<f32>,
    products: [Image<f32>; 3],
    sums: [ConvolveScratch; 3],
    response: Image<f32>,
    maxima: Vec<Candidate>,
}

impl CornerDetector {
    pub fn new(config: CornerDetectorConfig) -> Self {
        let box_kernel = vec![1.0; 2 * config.radius + 1];
        CornerDetector {
            config,
            box_kernel,
            products: [Image::new(0, 0), Image::new(0, 0), Image::new(0, 0)],
            sums: [
                ConvolveScratch::new(0, 0),
                ConvolveScratch::new(0, 0),
                ConvolveScratch::new(0, 0),
            ],
            response: Image::new(0, 0),
            maxima: Vec::new(),
        }
    }

    pub fn config(&self) -> &CornerDetectorConfig {
        &self.config
    }

    /// Response image of the last `detect` call (layer-0 coordinates).
    pub fn response(&self) -> &Image<f32> {
        &self.response
    }

    /// Compute the corner response for the given derivative images.
    pub fn compute_response(&mut self, dx: &Image<f32>, dy: &Image<f32>) {
        let (w, h) = (dx.width(), dx.height());
        let [xx, yy, xy] = &mut self.products;
        xx.clear_resize(w, h);
        yy.clear_resize(w, h);
        xy.clear_resize(w, h);
        for y in 0..h {
            let (row_x, row_y) = (dx.row(y), dy.row(y));
            let (out_xx, out_yy, out_xy) = (xx.row_mut(y), yy.row_mut(y), xy.row_mut(y));
            for x in 0..w {
                let (gx, gy) = (row_x[x], row_y[x]);
                out_xx[x] = gx * gx;
                out_yy[x] = gy * gy;
                out_xy[x] = gx * gy;
            }
        }

        for (product, scratch) in self.products.iter().zip(self.sums.iter_mut()) {
            convolve_separable_into(
                product,
                &self.box_kernel,
                &self.box_kernel,
                BorderPolicy::Zero,
                scratch,
            );
        }

        let r = self.config.radius;
        self.response.clear_resize(w, h);
        if w <= 2 * r || h <= 2 * r {
            return;
        }
        let [sxx, syy, sxy] = &self.sums;
        for y in r..h - r {
            for x in r..w - r {
                let a = sxx.output.get(x, y);
                let c = syy.output.get(x, y);
                let b = sxy.output.get(x, y);
                let score = match self.config.score {
                    CornerScore::ShiTomasi => {
                        let half_trace = 0.5 * (a + c);
                        let half_diff = 0.5 * (a - c);
                        half_trace - (half_diff * half_diff + b * b).sqrt()
                    }
                    CornerScore::Harris { k } => {
                        let trace = a + c;
                        (a * c - b * b) - k * trace * trace
                    }
                };
                self.response.set(x, y, score);
            }
        }
    }

    /// Collect local maxima of the response above the threshold, strongest first.
    fn collect_maxima(&mut self, scale: f32) {
        self.maxima.clear();
        let resp = &self.response;
        let (w, h) = (resp.width(), resp.height());
        for y in 0..h {
            for x in 0..w {
                let v = resp.get(x, y);
                if v <= self.config.threshold {
                    continue;
                }
                let is_max = (y.saturating_sub(1)..(y + 2).min(h)).all(|ny| {
                    (x.saturating_sub(1)..(x + 2).min(w)).all(|nx| resp.get(nx, ny) <= v)
                });
                if is_max {
                    self.maxima.push(Candidate {
                        x: x as f32 * scale,
                        y: y as f32 * scale,
                        score: v,
                    });
                }
            }
        }
        self.maxima.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    }
}

impl Default for CornerDetector {
    fn default() -> Self {
        Self::new(CornerDetectorConfig::default())
    }
}

#[inline]
fn within(a: (f32, f32), b: (f32, f32), radius_sq: f32) -> bool {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy < radius_sq
}

impl Detector for CornerDetector {
    fn detect<T: Pixel>(
        &mut self,
        pyramid: &ImagePyramid<T>,
        gradients: &GradientPyramid,
        excluded: &[(f32, f32)],
        exclude_radius: f32,
        max_count: usize,
        out: &mut Vec<Candidate>,
    ) {
        out.clear();
        if max_count == 0 || gradients.num_layers() == 0 || pyramid.num_layers() == 0 {
            return;
        }
        let grad = gradients.layer(0);
        self.compute_response(&grad.dx, &grad.dy);
        self.collect_maxima(pyramid.scaling_at_layer(0) as f32);

        let nms_sq = self.config.nms_radius * self.config.nms_radius;
        let exclude_sq = exclude_radius * exclude_radius;
        for cand in &self.maxima {
            let p = (cand.x, cand.y);
            if excluded.iter().any(|&e| within(p, e, exclude_sq)) {
                continue;
            }
            if out.iter().any(|o| within(p, (o.x, o.y), nms_sq)) {
                continue;
            }
            out.push(*cand);
            if out.len() == max_count {
                break;
            }
        }
        debug!(
            "corner detector: {} maxima, {} candidates (max {max_count}, {} excluded)",
            self.maxima.len(),
            out.len(),
            excluded.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::gradient::SobelGradient;
    use crate::pyramid::PyramidUpdater;

    fn square_scene(w: usize, h: usize, x0: usize, y0: usize, size: usize) -> Image<u8> {
        Image::from_fn(w, h, |x, y| {
            if (x0..x0 + size).contains(&x) && (y0..y0 + size).contains(&y) {
                200
            } else {
                30
            }
        })
    }

    fn prepare(img: Image<u8>, scales: &[usize]) -> (ImagePyramid<u8>, GradientPyramid) {
        let (w, h) = (img.width(), img.height());
        let mut pyr = ImagePyramid::with_scaling(w, h, true, scales).unwrap();
        PyramidUpdater::new(w, h).update(&Arc::new(img), &mut pyr).unwrap();
        let mut grads = GradientPyramid::for_pyramid(&pyr);
        grads.update(&mut SobelGradient::default(), &pyr).unwrap();
        (pyr, grads)
    }

    #[test]
    fn test_flat_image_no_corners() {
        let (pyr, grads) = prepare(Image::from_vec(40, 40, vec![77u8; 1600]), &[1]);
        let mut det = CornerDetector::default();
        let mut out = Vec::new();
        det.detect(&pyr, &grads, &[], 0.0, 100, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_square_corners_found_near_vertices() {
        let (pyr, grads) = prepare(square_scene(64, 64, 20, 20, 24), &[1, 2]);
        let mut det = CornerDetector::default();
        let mut out = Vec::new();
        det.detect(&pyr, &grads, &[], 0.0, 100, &mut out);
        assert!(out.len() >= 4, "expected the four square corners, got {}", out.len());

        let vertices = [(19.5, 19.5), (43.5, 19.5), (19.5, 43.5), (43.5, 43.5)];
        for v in vertices {
            assert!(
                out.iter().any(|c| within((c.x, c.y), v, 4.0 * 4.0)),
                "no candidate near vertex {v:?}"
            );
        }
        for pair in out.windows(2) {
            assert!(pair[0].score >= pair[1].score, "candidates not strongest first");
        }
    }

    #[test]
    fn test_exclusion_and_cap() {
        let (pyr, grads) = prepare(square_scene(64, 64, 20, 20, 24), &[1]);
        let mut det = CornerDetector::default();
        let mut out = Vec::new();

        det.detect(&pyr, &grads, &[], 0.0, 1, &mut out);
        assert_eq!(out.len(), 1);

        let excluded = [(20.0, 20.0)];
        det.detect(&pyr, &grads, &excluded, 6.0, 100, &mut out);
        assert!(!out.is_empty());
        for c in &out {
            assert!(
                !within((c.x, c.y), excluded[0], 36.0),
                "candidate ({}, {}) inside exclusion zone",
                c.x,
                c.y
            );
        }
    }

    #[test]
    fn test_nms_spacing() {
        let (pyr, grads) = prepare(square_scene(64, 64, 20, 20, 24), &[1]);
        let mut det = CornerDetector::new(CornerDetectorConfig {
            nms_radius: 5.0,
            ..CornerDetectorConfig::default()
        });
        let mut out = Vec::new();
        det.detect(&pyr, &grads, &[], 0.0, 100, &mut out);
        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                assert!(!within((a.x, a.y), (b.x, b.y), 25.0), "candidates closer than nms radius");
            }
        }
    }

    #[test]
    fn test_harris_score_detects_corners() {
        let (pyr, grads) = prepare(square_scene(48, 48, 12, 12, 20), &[1]);
        let mut det = CornerDetector::new(CornerDetectorConfig {
            score: CornerScore::Harris { k: 0.04 },
            ..CornerDetectorConfig::default()
        });
        let mut out = Vec::new();
        det.detect(&pyr, &grads, &[], 0.0, 10, &mut out);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_bottom_coordinates_with_downsampled_layer_zero() {
        // Layer 0 at half resolution: candidates must come back in full-res pixels.
        let (pyr, grads) = prepare(square_scene(96, 96, 30, 30, 36), &[2]);
        let mut det = CornerDetector::default();
        let mut out = Vec::new();
        det.detect(&pyr, &grads, &[], 0.0, 10, &mut out);
        assert!(!out.is_empty());
        assert!(out.iter().any(|c| within((c.x, c.y), (30.0, 30.0), 6.0 * 6.0)));
    }
}
