// tracker.rs — Frame-by-frame point tracker.
//
// Ties the pieces together into the loop a motion-estimation backend
// calls once per camera frame:
//
//   1. Update the pyramid and its gradients from the frame
//   2. Track every active feature (optionally on the rayon pool)
//   3. Re-describe features that succeeded; drop the rest to the pool
//   4. Optionally track the survivors back into the previous frame and
//      drop those that don't return to where they started
//   5. Optionally top the active set back up through the selector,
//      giving new features fresh track ids
//
// Forward-backward validation needs the previous frame's pyramid, so the
// tracker then keeps two pyramid buffers and alternates between them.

use std::sync::Arc;

use log::debug;

use crate::corner::Detector;
use crate::error::KltError;
use crate::feature::{FeaturePool, PyramidFeature, SlotId};
use crate::gradient::{GradientProvider, GradientPyramid};
use crate::image::{Image, Pixel};
use crate::klt::{KltConfig, PyramidKltTracker, TrackOutcome};
use crate::pyramid::{ImagePyramid, PyramidConfig, PyramidUpdater};
use crate::selector::{PyramidFeatureSelector, SelectorConfig};

/// Point tracker configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PointTrackerConfig {
    pub klt: KltConfig,
    pub pyramid: PyramidConfig,
    /// `selector.target_count` is also the pool capacity.
    pub selector: SelectorConfig,
    /// Maximum forward-backward distance in bottom pixels. `None` disables
    /// the backward check.
    pub forward_backward_tolerance: Option<f32>,
    /// Replenish features at the end of every `process` call.
    pub auto_spawn: bool,
    /// Track features on the rayon thread pool.
    pub parallel: bool,
}

impl Default for PointTrackerConfig {
    fn default() -> Self {
        PointTrackerConfig {
            klt: KltConfig::default(),
            pyramid: PyramidConfig::default(),
            selector: SelectorConfig::default(),
            forward_backward_tolerance: None,
            auto_spawn: true,
            parallel: false,
        }
    }
}

/// Statistics returned after processing each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    /// Features that survived tracking into this frame.
    pub tracked: usize,
    /// Features lost in this frame.
    pub dropped: usize,
    /// Features added to replenish the active set.
    pub spawned: usize,
    /// Active features after this frame.
    pub total: usize,
}

/// Snapshot of one track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackView {
    pub id: u64,
    pub slot: SlotId,
    pub x: f32,
    pub y: f32,
}

impl TrackView {
    fn of(slot: SlotId, feature: &PyramidFeature) -> Self {
        TrackView {
            id: feature.track_id.unwrap_or(u64::MAX),
            slot,
            x: feature.x,
            y: feature.y,
        }
    }
}

/// Pyramid and derivatives of one frame.
struct FrameBuffers<T: Pixel> {
    pyramid: ImagePyramid<T>,
    gradients: GradientPyramid,
}

/// Pyramidal KLT point tracker with automatic replenishment.
pub struct KltPointTracker<T: Pixel, P: GradientProvider, D: Detector> {
    config: PointTrackerConfig,
    /// One buffer set, or two when validating forward-backward.
    buffers: Vec<FrameBuffers<T>>,
    /// Index into `buffers` of the most recent frame.
    current: usize,
    updater: PyramidUpdater,
    provider: P,
    klt: PyramidKltTracker,
    selector: PyramidFeatureSelector<D>,
    pool: FeaturePool,
    /// Where each slot was in the previous frame, for the backward check.
    prev_positions: Vec<(f32, f32)>,
    /// Slots dropped by the current pass, reused across frames.
    lost: Vec<SlotId>,
    next_track_id: u64,
    spawned: Vec<TrackView>,
    dropped: Vec<TrackView>,
}

impl<T: Pixel, P: GradientProvider, D: Detector> KltPointTracker<T, P, D> {
    /// Create a tracker for frames of `width × height`.
    pub fn new(
        config: PointTrackerConfig,
        width: usize,
        height: usize,
        provider: P,
        detector: D,
    ) -> Result<Self, KltError> {
        let num_buffers = if config.forward_backward_tolerance.is_some() { 2 } else { 1 };
        let mut buffers = Vec::with_capacity(num_buffers);
        for _ in 0..num_buffers {
            let pyramid = config.pyramid.build::<T>(width, height)?;
            let gradients = GradientPyramid::for_pyramid(&pyramid);
            buffers.push(FrameBuffers { pyramid, gradients });
        }

        let capacity = config.selector.target_count;
        let num_layers = config.pyramid.scale_factors.len();
        let klt = PyramidKltTracker::new(config.klt.clone());
        let selector = PyramidFeatureSelector::new(config.selector.clone(), detector, klt.clone());

        Ok(KltPointTracker {
            updater: PyramidUpdater::from_config(&config.pyramid, width, height),
            pool: FeaturePool::new(capacity, num_layers, config.klt.radius),
            prev_positions: vec![(0.0, 0.0); capacity],
            lost: Vec::with_capacity(capacity),
            config,
            buffers,
            current: 0,
            provider,
            klt,
            selector,
            next_track_id: 0,
            spawned: Vec::with_capacity(capacity),
            dropped: Vec::with_capacity(capacity),
        })
    }

    pub fn config(&self) -> &PointTrackerConfig {
        &self.config
    }

    /// Pyramid of the most recent frame.
    pub fn pyramid(&self) -> &ImagePyramid<T> {
        &self.buffers[self.current].pyramid
    }

    /// Derivatives of the most recent frame.
    pub fn gradients(&self) -> &GradientPyramid {
        &self.buffers[self.current].gradients
    }

    pub fn pool(&self) -> &FeaturePool {
        &self.pool
    }

    /// Process one frame: track, validate, and (with `auto_spawn`) replenish.
    pub fn process(&mut self, frame: &Arc<Image<T>>) -> Result<FrameStats, KltError> {
        self.spawned.clear();
        self.dropped.clear();
        let had_tracks = !self.pool.active().is_empty();

        // Write the new frame over the oldest buffer.
        let prev = self.current;
        let curr = (self.current + 1) % self.buffers.len();
        {
            let buf = &mut self.buffers[curr];
            self.updater.update(frame, &mut buf.pyramid)?;
            buf.gradients.update(&mut self.provider, &buf.pyramid)?;
        }
        self.current = curr;

        self.track_forward();
        if let Some(tolerance) = self.config.forward_backward_tolerance {
            if had_tracks && self.buffers[prev].pyramid.is_updated() {
                self.validate_backward(prev, tolerance);
            }
        }
        let tracked = self.pool.active().len();

        let spawned = if self.config.auto_spawn { self.spawn_tracks()? } else { 0 };

        let stats = FrameStats {
            tracked,
            dropped: self.dropped.len(),
            spawned,
            total: self.pool.active().len(),
        };
        debug!(
            "frame: {} tracked, {} dropped, {} spawned, {} total",
            stats.tracked, stats.dropped, stats.spawned, stats.total
        );
        Ok(stats)
    }

    fn track_forward(&mut self) {
        let buf = &self.buffers[self.current];
        let (pyramid, gradients) = (&buf.pyramid, &buf.gradients);
        let klt = &self.klt;
        let max_x = pyramid.bottom_width() as f32 - 1.0;
        let max_y = pyramid.bottom_height() as f32 - 1.0;

        self.pool.for_each_active_mut(self.config.parallel, |_, feature| {
            if klt.track(feature, pyramid, gradients) != TrackOutcome::Success {
                return;
            }
            let centre_inside =
                feature.x >= 0.0 && feature.y >= 0.0 && feature.x <= max_x && feature.y <= max_y;
            if !centre_inside || !klt.set_description(feature, pyramid, gradients) {
                feature.last_outcome = Some(TrackOutcome::OutOfBounds);
            }
        });

        self.lost.clear();
        self.pool
            .retain_active(|_, f| f.last_outcome == Some(TrackOutcome::Success), &mut self.lost);
        self.record_lost();
    }

    /// Track every active feature back into buffer `prev` and drop those
    /// that don't land within `tolerance` of their previous position.
    fn validate_backward(&mut self, prev: usize, tolerance: f32) {
        let buf = &self.buffers[prev];
        let klt = &self.klt;
        let prev_positions = &mut self.prev_positions;
        let tol_sq = tolerance * tolerance;

        self.lost.clear();
        self.pool.retain_active(
            |id, feature| {
                let (x, y) = (feature.x, feature.y);
                let outcome = klt.track(feature, &buf.pyramid, &buf.gradients);
                let (px, py) = prev_positions[id.0];
                let (dx, dy) = (feature.x - px, feature.y - py);
                // Keep the forward position either way.
                feature.set_position(x, y);
                if outcome != TrackOutcome::Success || dx * dx + dy * dy > tol_sq {
                    feature.last_outcome = Some(outcome);
                    return false;
                }
                feature.last_outcome = Some(TrackOutcome::Success);
                prev_positions[id.0] = (x, y);
                true
            },
            &mut self.lost,
        );
        if !self.lost.is_empty() {
            debug!("forward-backward check dropped {} tracks", self.lost.len());
        }
        self.record_lost();
    }

    /// Snapshot the slots in `lost` into `dropped`.
    fn record_lost(&mut self) {
        let pool = &self.pool;
        self.dropped
            .extend(self.lost.iter().map(|&id| TrackView::of(id, pool.feature(id))));
    }

    /// Run the selector on the latest frame and assign ids to new features.
    pub fn spawn_tracks(&mut self) -> Result<usize, KltError> {
        self.spawned.clear();
        let buf = &self.buffers[self.current];
        let count = self
            .selector
            .compute(&mut self.pool, &buf.pyramid, &buf.gradients)?;
        for &id in self.selector.activated() {
            let feature = self.pool.feature_mut(id);
            feature.track_id = Some(self.next_track_id);
            feature.last_outcome = Some(TrackOutcome::Success);
            self.next_track_id += 1;
            self.prev_positions[id.0] = (feature.x, feature.y);
            self.spawned.push(TrackView::of(id, feature));
        }
        Ok(count)
    }

    /// Start tracking the point (x, y) of the latest frame.
    ///
    /// Returns the new track id, or `None` if no slot is free, no frame has
    /// been processed, the point is outside the frame or its window does
    /// not fit.
    pub fn add_track(&mut self, x: f32, y: f32) -> Option<u64> {
        let buf = &self.buffers[self.current];
        if !buf.pyramid.is_updated() || !buf.gradients.is_updated() {
            return None;
        }
        let inside = x >= 0.0
            && y >= 0.0
            && x <= buf.pyramid.bottom_width() as f32 - 1.0
            && y <= buf.pyramid.bottom_height() as f32 - 1.0;
        if !inside {
            return None;
        }

        let id = self.pool.take_available()?;
        let feature = self.pool.feature_mut(id);
        feature.reset();
        feature.set_position(x, y);
        if !self.klt.set_description(feature, &buf.pyramid, &buf.gradients) {
            self.pool.release(id);
            return None;
        }
        let track_id = self.next_track_id;
        self.next_track_id += 1;
        feature.track_id = Some(track_id);
        feature.last_outcome = Some(TrackOutcome::Success);
        self.prev_positions[id.0] = (x, y);
        self.pool.activate(id);
        Some(track_id)
    }

    /// Stop tracking `track_id`. Returns false if no active track has that id.
    pub fn drop_track(&mut self, track_id: u64) -> bool {
        let found = self
            .pool
            .iter_active()
            .find(|(_, f)| f.track_id == Some(track_id))
            .map(|(id, _)| id);
        match found {
            Some(id) => self.pool.deactivate(id),
            None => false,
        }
    }

    /// Stop tracking everything.
    pub fn drop_all_tracks(&mut self) {
        self.pool.deactivate_all();
        self.dropped.clear();
    }

    /// Drop all tracks and restart track ids from zero.
    pub fn reset(&mut self) {
        self.drop_all_tracks();
        self.spawned.clear();
        self.next_track_id = 0;
    }

    /// Currently active tracks, in activation order.
    pub fn active_tracks(&self) -> impl Iterator<Item = TrackView> + '_ {
        self.pool.iter_active().map(|(id, f)| TrackView::of(id, f))
    }

    /// Tracks added by the last `process` / `spawn_tracks` call.
    pub fn spawned_tracks(&self) -> &[TrackView] {
        &self.spawned
    }

    /// Tracks lost in the last `process` call, at their last known position.
    pub fn dropped_tracks(&self) -> &[TrackView] {
        &self.dropped
    }

    /// Total number of track ids handed out so far.
    pub fn total_tracks(&self) -> u64 {
        self.next_track_id
    }
}
