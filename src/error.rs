/// Errors returned by the pyramid, selector and point tracker.
///
/// Per-feature tracking failures are not errors; they are reported as
/// [`crate::klt::TrackOutcome`] values.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KltError {
    /// The scale-factor sequence was empty.
    #[error("pyramid scale factors must not be empty")]
    EmptyScaling,

    /// A scale factor was smaller than one.
    #[error("pyramid scale factor at layer {layer} is {factor}, must be >= 1")]
    InvalidScaling {
        /// Offending layer.
        layer: usize,
        /// Offending factor.
        factor: usize,
    },

    /// The product of the scale factors up to `layer` does not fit in `usize`.
    #[error("cumulative pyramid scale overflows at layer {layer}")]
    ScalingOverflow {
        /// First layer whose cumulative scale overflows.
        layer: usize,
    },

    /// The pyramid has no layers yet; `set_scaling` was never called.
    #[error("pyramid scaling has not been set")]
    ScalingNotSet,

    /// An image did not have the expected shape.
    #[error("expected a {expected_width}x{expected_height} image, got {width}x{height}")]
    ShapeMismatch {
        /// Expected width.
        expected_width: usize,
        /// Expected height.
        expected_height: usize,
        /// Actual width.
        width: usize,
        /// Actual height.
        height: usize,
    },

    /// The pyramid or gradients were used before the first update.
    #[error("pyramid has not been updated with a frame yet")]
    NotUpdated,

    /// The detector returned a candidate that is not a finite point inside the image.
    #[error("detector candidate {index} at ({x}, {y}) is outside the image or not finite")]
    MalformedCandidate {
        /// Index of the candidate in the detector output.
        index: usize,
        /// Candidate x in bottom-layer coordinates.
        x: f32,
        /// Candidate y in bottom-layer coordinates.
        y: f32,
    },

    /// A pool or a feature was configured with a different layer count than the pyramid.
    #[error("feature pool holds {pool} description layers but the pyramid has {pyramid}")]
    LayerCountMismatch {
        /// Layers per feature in the pool.
        pool: usize,
        /// Layers in the pyramid.
        pyramid: usize,
    },
}
