// selector.rs — Keeps the active feature set topped up.
//
// Each call compares the number of active features with the target. If
// features were lost, the detector is asked for that many new candidates
// away from the surviving tracks; each accepted candidate takes a free
// slot from the pool and gets its description captured there.
//
// Surviving features are never touched: their slots, positions,
// descriptions and order in the active list stay as they are.

use log::{debug, warn};

use crate::corner::{Candidate, Detector};
use crate::error::KltError;
use crate::feature::{FeaturePool, SlotId};
use crate::gradient::GradientPyramid;
use crate::image::Pixel;
use crate::klt::PyramidKltTracker;
use crate::pyramid::ImagePyramid;

/// Replenishment parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SelectorConfig {
    /// Number of active features to maintain.
    pub target_count: usize,
    /// New features must be at least this far from active ones, in bottom pixels.
    pub exclude_radius: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            target_count: 100,
            exclude_radius: 5.0,
        }
    }
}

/// Active/available pool management around a detector.
pub struct PyramidFeatureSelector<D: Detector> {
    config: SelectorConfig,
    detector: D,
    describer: PyramidKltTracker,
    excluded: Vec<(f32, f32)>,
    candidates: Vec<Candidate>,
    activated: Vec<SlotId>,
}

impl<D: Detector> PyramidFeatureSelector<D> {
    /// `describer` captures the descriptions of newly activated features;
    /// it should be configured like the tracker that will track them.
    pub fn new(config: SelectorConfig, detector: D, describer: PyramidKltTracker) -> Self {
        PyramidFeatureSelector {
            config,
            detector,
            describer,
            excluded: Vec::new(),
            candidates: Vec::new(),
            activated: Vec::new(),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn set_target_count(&mut self, target_count: usize) {
        self.config.target_count = target_count;
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    /// Slots activated by the last `compute` call, in activation order.
    pub fn activated(&self) -> &[SlotId] {
        &self.activated
    }

    /// Top up `pool`'s active set towards the target count.
    ///
    /// Returns the number of slots activated. Fails without touching the
    /// pool if the pyramid or gradients have not been updated, if the
    /// pool's depth differs from the pyramid's, or if the detector returns
    /// a candidate that is not a finite point inside the bottom image.
    pub fn compute<T: Pixel>(
        &mut self,
        pool: &mut FeaturePool,
        pyramid: &ImagePyramid<T>,
        gradients: &GradientPyramid,
    ) -> Result<usize, KltError> {
        self.activated.clear();

        let need = self.config.target_count.saturating_sub(pool.active().len());
        if need == 0 {
            return Ok(0);
        }
        if !pyramid.is_updated() || !gradients.is_updated() {
            return Err(KltError::NotUpdated);
        }
        if pool.num_layers() != pyramid.num_layers() {
            return Err(KltError::LayerCountMismatch {
                pool: pool.num_layers(),
                pyramid: pyramid.num_layers(),
            });
        }

        pool.active_positions(&mut self.excluded);
        self.detector.detect(
            pyramid,
            gradients,
            &self.excluded,
            self.config.exclude_radius,
            need,
            &mut self.candidates,
        );

        let max_x = pyramid.bottom_width() as f32 - 1.0;
        let max_y = pyramid.bottom_height() as f32 - 1.0;
        for (index, c) in self.candidates.iter().enumerate() {
            let inside = c.x.is_finite()
                && c.y.is_finite()
                && c.x >= 0.0
                && c.y >= 0.0
                && c.x <= max_x
                && c.y <= max_y;
            if !inside {
                warn!("detector returned candidate {index} at ({}, {}) outside the image", c.x, c.y);
                return Err(KltError::MalformedCandidate {
                    index,
                    x: c.x,
                    y: c.y,
                });
            }
        }

        let mut rejected = 0usize;
        for c in self.candidates.iter().take(need) {
            let Some(id) = pool.take_available() else {
                break;
            };
            let feature = pool.feature_mut(id);
            feature.reset();
            feature.set_position(c.x, c.y);
            if self.describer.set_description(feature, pyramid, gradients) {
                pool.activate(id);
                self.activated.push(id);
            } else {
                pool.release(id);
                rejected += 1;
            }
        }

        debug!(
            "selector: need {need}, {} candidates, {} activated, {rejected} rejected, {} active",
            self.candidates.len(),
            self.activated.len(),
            pool.active().len()
        );
        Ok(self.activated.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::gradient::SobelGradient;
    use crate::image::Image;
    use crate::klt::KltConfig;
    use crate::pyramid::PyramidUpdater;

    /// Returns a fixed candidate list and counts calls.
    struct FixedDetector {
        candidates: Vec<Candidate>,
        calls: usize,
    }

    impl Detector for FixedDetector {
        fn detect<T: Pixel>(
            &mut self,
            _pyramid: &ImagePyramid<T>,
            _gradients: &GradientPyramid,
            _excluded: &[(f32, f32)],
            _exclude_radius: f32,
            max_count: usize,
            out: &mut Vec<Candidate>,
        ) {
            self.calls += 1;
            out.clear();
            out.extend(self.candidates.iter().take(max_count).copied());
        }
    }

    fn textured(w: usize, h: usize) -> (ImagePyramid<u8>, GradientPyramid) {
        let img = Image::from_fn(w, h, |x, y| ((x * 37 + y * 91) % 251) as u8);
        let mut pyr = ImagePyramid::with_scaling(w, h, true, &[1, 2]).unwrap();
        PyramidUpdater::new(w, h).update(&Arc::new(img), &mut pyr).unwrap();
        let mut grads = GradientPyramid::for_pyramid(&pyr);
        grads.update(&mut SobelGradient::default(), &pyr).unwrap();
        (pyr, grads)
    }

    fn at(x: f32, y: f32) -> Candidate {
        Candidate { x, y, score: 1.0 }
    }

    fn selector(target: usize, candidates: Vec<Candidate>) -> PyramidFeatureSelector<FixedDetector> {
        PyramidFeatureSelector::new(
            SelectorConfig {
                target_count: target,
                exclude_radius: 2.0,
            },
            FixedDetector { candidates, calls: 0 },
            PyramidKltTracker::new(KltConfig::default()),
        )
    }

    #[test]
    fn test_rejected_candidate_returns_slot() {
        let (pyr, grads) = textured(40, 40);
        let mut pool = FeaturePool::new(4, 2, 3);
        // (1, 1) can't fit a radius-3 window.
        let mut sel = selector(4, vec![at(1.0, 1.0), at(20.0, 20.0)]);
        assert_eq!(sel.compute(&mut pool, &pyr, &grads).unwrap(), 1);
        assert_eq!(pool.active().len(), 1);
        assert_eq!(pool.available().len(), 3);
        let feat = pool.feature(pool.active()[0]);
        assert_eq!((feat.x, feat.y), (20.0, 20.0));
    }

    #[test]
    fn test_takes_at_most_need() {
        let (pyr, grads) = textured(40, 40);
        let mut pool = FeaturePool::new(10, 2, 3);
        let cands = (0..6).map(|i| at(8.0 + 4.0 * i as f32, 20.0)).collect();
        let mut sel = selector(3, cands);
        assert_eq!(sel.compute(&mut pool, &pyr, &grads).unwrap(), 3);
        assert_eq!(sel.activated().len(), 3);
        assert_eq!(pool.active().len(), 3);
    }

    #[test]
    fn test_layer_count_mismatch() {
        let (pyr, grads) = textured(40, 40);
        let mut pool = FeaturePool::new(4, 3, 3);
        let mut sel = selector(4, vec![at(20.0, 20.0)]);
        assert_eq!(
            sel.compute(&mut pool, &pyr, &grads),
            Err(KltError::LayerCountMismatch { pool: 3, pyramid: 2 })
        );
        assert_eq!(sel.detector().calls, 0);
    }

    #[test]
    fn test_nan_candidate_rejected() {
        let (pyr, grads) = textured(40, 40);
        let mut pool = FeaturePool::new(4, 2, 3);
        let mut sel = selector(4, vec![at(20.0, 20.0), at(f32::NAN, 3.0)]);
        let err = sel.compute(&mut pool, &pyr, &grads).unwrap_err();
        assert!(matches!(err, KltError::MalformedCandidate { index: 1, .. }));
        assert!(pool.active().is_empty());
        assert_eq!(pool.available().len(), 4);
    }
}
