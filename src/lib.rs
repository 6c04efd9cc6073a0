// pyramid_klt: sparse pyramidal KLT feature tracking.
//
// Per frame: PyramidUpdater → GradientPyramid → PyramidKltTracker on the
// active features → PyramidFeatureSelector to replenish lost ones.
// KltPointTracker runs that loop and hands out track ids.

pub mod image;
pub mod convolution;
pub mod error;
pub mod pyramid;
pub mod gradient;
pub mod feature;
pub mod klt;
pub mod corner;
pub mod selector;
pub mod tracker;

pub use corner::{Candidate, CornerDetector, CornerDetectorConfig, CornerScore, Detector};
pub use error::KltError;
pub use feature::{FeaturePool, LayerDescription, PyramidFeature, SlotId};
pub use gradient::{CentralDifference, GradientProvider, GradientPyramid, SobelGradient};
pub use image::{Image, Pixel};
pub use klt::{KltConfig, LkMethod, PyramidKltTracker, TrackOutcome};
pub use pyramid::{ImagePyramid, PyramidConfig, PyramidUpdater};
pub use selector::{PyramidFeatureSelector, SelectorConfig};
pub use tracker::{FrameStats, KltPointTracker, PointTrackerConfig, TrackView};
