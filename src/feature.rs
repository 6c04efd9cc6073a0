// feature.rs — Persistent per-feature state and the slot arena holding it.
//
// A PyramidFeature owns one LayerDescription per pyramid layer: the
// intensity and both derivatives sampled over the (2r+1)² window around
// the feature, plus the window's structure-matrix entries. All buffers
// are created with the pool and only overwritten afterwards.
//
// FeaturePool is an arena of features with two disjoint index lists,
// `active` and `available`. A feature's identity is its slot index; moving
// a slot between the lists never moves the feature itself.

use rayon::prelude::*;

use crate::klt::TrackOutcome;

/// Stable identity of a feature: its index in the pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

/// Window samples of one feature at one pyramid layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescription {
    /// Intensity, row-major over the window.
    pub intensity: Vec<f32>,
    /// Horizontal derivative, same layout.
    pub deriv_x: Vec<f32>,
    /// Vertical derivative, same layout.
    pub deriv_y: Vec<f32>,
    /// Σ Ix² over the window.
    pub gxx: f32,
    /// Σ Iy² over the window.
    pub gyy: f32,
    /// Σ Ix·Iy over the window.
    pub gxy: f32,
}

impl LayerDescription {
    /// Zeroed description for a window of `window_len` samples.
    pub fn new(window_len: usize) -> Self {
        LayerDescription {
            intensity: vec![0.0; window_len],
            deriv_x: vec![0.0; window_len],
            deriv_y: vec![0.0; window_len],
            gxx: 0.0,
            gyy: 0.0,
            gxy: 0.0,
        }
    }

    /// Determinant of the stored structure matrix.
    pub fn determinant(&self) -> f32 {
        self.gxx * self.gyy - self.gxy * self.gxy
    }
}

/// A tracked point and everything needed to track it into the next frame.
#[derive(Debug, Clone)]
pub struct PyramidFeature {
    /// Sub-pixel x in bottom-layer coordinates.
    pub x: f32,
    /// Sub-pixel y in bottom-layer coordinates.
    pub y: f32,
    /// Highest layer with a valid description, `None` if not even layer 0
    /// could be described.
    pub max_layer: Option<usize>,
    /// Track id assigned by the point tracker; `None` while unassigned.
    pub track_id: Option<u64>,
    /// Outcome of the most recent `track` call.
    pub last_outcome: Option<TrackOutcome>,
    radius: usize,
    descriptions: Vec<LayerDescription>,
}

impl PyramidFeature {
    /// Feature with room for `num_layers` descriptions of radius `radius`.
    pub fn new(num_layers: usize, radius: usize) -> Self {
        let side = 2 * radius + 1;
        PyramidFeature {
            x: 0.0,
            y: 0.0,
            max_layer: None,
            track_id: None,
            last_outcome: None,
            radius,
            descriptions: (0..num_layers).map(|_| LayerDescription::new(side * side)).collect(),
        }
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.x = x;
        self.y = y;
    }

    /// Window radius `r`; the window is `(2r+1)²` samples.
    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Number of samples in one window.
    pub fn window_len(&self) -> usize {
        let side = 2 * self.radius + 1;
        side * side
    }

    /// Number of description slots (the pyramid depth the feature was built for).
    pub fn num_layers(&self) -> usize {
        self.descriptions.len()
    }

    /// Description at `layer`.
    ///
    /// # Panics
    /// Panics if `layer >= num_layers()`.
    pub fn description(&self, layer: usize) -> &LayerDescription {
        &self.descriptions[layer]
    }

    pub fn description_mut(&mut self, layer: usize) -> &mut LayerDescription {
        &mut self.descriptions[layer]
    }

    /// Forget everything but the buffers.
    pub fn reset(&mut self) {
        self.x = 0.0;
        self.y = 0.0;
        self.max_layer = None;
        self.track_id = None;
        self.last_outcome = None;
    }
}

/// Fixed-size arena of features split into `active` and `available` lists.
///
/// `active().len() + available().len()` always equals `capacity()`.
#[derive(Debug, Clone)]
pub struct FeaturePool {
    slots: Vec<PyramidFeature>,
    active: Vec<SlotId>,
    available: Vec<SlotId>,
    is_active: Vec<bool>,
    num_layers: usize,
    radius: usize,
}

impl FeaturePool {
    /// Pool of `capacity` features, all available, each with `num_layers`
    /// descriptions of radius `radius`.
    pub fn new(capacity: usize, num_layers: usize, radius: usize) -> Self {
        FeaturePool {
            slots: (0..capacity).map(|_| PyramidFeature::new(num_layers, radius)).collect(),
            active: Vec::with_capacity(capacity),
            // Reversed so that slots are handed out in index order.
            available: (0..capacity).rev().map(SlotId).collect(),
            is_active: vec![false; capacity],
            num_layers,
            radius,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Active slots in activation order.
    pub fn active(&self) -> &[SlotId] {
        &self.active
    }

    /// Free slots; the last entry is handed out next.
    pub fn available(&self) -> &[SlotId] {
        &self.available
    }

    pub fn is_active(&self, id: SlotId) -> bool {
        self.is_active[id.0]
    }

    /// Feature in slot `id`.
    ///
    /// # Panics
    /// Panics if `id` is not a slot of this pool.
    pub fn feature(&self, id: SlotId) -> &PyramidFeature {
        &self.slots[id.0]
    }

    pub fn feature_mut(&mut self, id: SlotId) -> &mut PyramidFeature {
        &mut self.slots[id.0]
    }

    /// Iterate over active features in activation order.
    pub fn iter_active(&self) -> impl Iterator<Item = (SlotId, &PyramidFeature)> + '_ {
        self.active.iter().map(move |&id| (id, &self.slots[id.0]))
    }

    /// Append the positions of all active features to `out` (after clearing it).
    pub fn active_positions(&self, out: &mut Vec<(f32, f32)>) {
        out.clear();
        out.extend(self.iter_active().map(|(_, f)| (f.x, f.y)));
    }

    /// Take the next free slot out of `available`.
    ///
    /// The slot belongs to neither list until it is passed to `activate` or
    /// `release`.
    pub fn take_available(&mut self) -> Option<SlotId> {
        self.available.pop()
    }

    /// Put a slot obtained from `take_available` back without activating it.
    pub fn release(&mut self, id: SlotId) {
        debug_assert!(!self.is_active[id.0] && !self.available.contains(&id));
        self.available.push(id);
    }

    /// Append a slot obtained from `take_available` to `active`.
    pub fn activate(&mut self, id: SlotId) {
        debug_assert!(!self.is_active[id.0] && !self.available.contains(&id));
        self.is_active[id.0] = true;
        self.active.push(id);
    }

    /// Move one active slot back to `available`, preserving the order of
    /// the remaining active slots. Returns false if the slot was not active.
    pub fn deactivate(&mut self, id: SlotId) -> bool {
        if !self.is_active.get(id.0).copied().unwrap_or(false) {
            return false;
        }
        if let Some(pos) = self.active.iter().position(|&a| a == id) {
            self.active.remove(pos);
        }
        self.is_active[id.0] = false;
        self.available.push(id);
        true
    }

    /// Keep the active features for which `keep` returns true; move the
    /// rest to `available`, appending their ids to `dropped`.
    pub fn retain_active(
        &mut self,
        mut keep: impl FnMut(SlotId, &mut PyramidFeature) -> bool,
        dropped: &mut Vec<SlotId>,
    ) {
        let slots = &mut self.slots;
        let available = &mut self.available;
        let is_active = &mut self.is_active;
        self.active.retain(|&id| {
            if keep(id, &mut slots[id.0]) {
                return true;
            }
            is_active[id.0] = false;
            available.push(id);
            dropped.push(id);
            false
        });
    }

    /// Move every active slot to `available`.
    pub fn deactivate_all(&mut self) {
        for id in self.active.drain(..) {
            self.is_active[id.0] = false;
            self.available.push(id);
        }
    }

    /// Swap two entries of the active list. Identities are unaffected.
    pub fn swap_active(&mut self, a: usize, b: usize) {
        self.active.swap(a, b);
    }

    /// Run `f` on every active feature, optionally on the rayon pool.
    ///
    /// Each call sees only its own slot, so `f` needs no synchronisation.
    pub fn for_each_active_mut<F>(&mut self, parallel: bool, f: F)
    where
        F: Fn(SlotId, &mut PyramidFeature) + Send + Sync,
    {
        if parallel {
            let is_active = &self.is_active;
            self.slots
                .par_iter_mut()
                .enumerate()
                .filter(|(i, _)| is_active[*i])
                .for_each(|(i, feat)| f(SlotId(i), feat));
        } else {
            for &id in &self.active {
                f(id, &mut self.slots[id.0]);
            }
        }
    }
}
