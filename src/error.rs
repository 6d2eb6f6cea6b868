// error.rs — Error taxonomy for configuration, estimation and the engine.
//
// Everything fallible in the crate returns one of these. The split mirrors
// how a caller reacts:
//   ConfigError                  — bad intrinsics or tuning values, fatal at startup
//   InsufficientCorrespondences  — too few tracks for a two-view solve
//   DegenerateGeometry           — the tracks do not constrain a pose
//   InitializationFailed         — bootstrap could not produce two frames
//   EmptyImage                   — a zero-sized input image was supplied
//   InvalidState / Halted        — the engine was driven out of order
//
// Reaching the end of the image sequence is not an error; see
// `odometry::StepOutcome::EndOfSequence`.

use thiserror::Error;

use crate::odometry::TrackState;

/// Invalid or missing configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("missing required key `{0}`")]
    Missing(String),

    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("`{key}` must be finite, got {value}")]
    NotFinite { key: String, value: f64 },

    #[error("`{key}` must be positive, got {value}")]
    NonPositive { key: String, value: f64 },
}

/// Why a correspondence set could not be turned into a pose.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Degeneracy {
    #[error("no essential matrix hypothesis could be computed")]
    NoHypothesis,

    #[error("only {inliers} of {total} correspondences support the best hypothesis")]
    LowInlierRatio { inliers: usize, total: usize },

    #[error("median parallax {median_px:.3} px is below {min_px:.3} px (rotation-only motion)")]
    InsufficientParallax { median_px: f64, min_px: f64 },

    #[error("best decomposition puts only {valid} of {inliers} inliers in front of both cameras")]
    Chirality { valid: usize, inliers: usize },
}

/// Why `OdometryEngine::initialize` failed.
#[derive(Debug, Error)]
pub enum InitFailure {
    #[error("image source holds {0} image(s), at least 2 are required")]
    NotEnoughImages(usize),

    #[error("image {0} is missing from the source")]
    MissingImage(usize),

    #[error("image {0} has no pixels")]
    EmptyImage(usize),

    #[error("no features detected in the first frame")]
    NoFeatures,

    #[error(transparent)]
    Pose(Box<OdometryError>),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum OdometryError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("insufficient correspondences: found {found}, need at least {required}")]
    InsufficientCorrespondences { found: usize, required: usize },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(#[from] Degeneracy),

    #[error("initialization failed: {0}")]
    InitializationFailed(#[source] InitFailure),

    #[error("image for frame {frame_index} has no pixels")]
    EmptyImage { frame_index: usize },

    #[error("`{operation}` is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TrackState,
    },

    #[error("engine halted after an unrecovered failure at frame {frame_index}")]
    Halted { frame_index: usize },
}

impl OdometryError {
    /// True for failures that re-detecting features might fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OdometryError::InsufficientCorrespondences { .. } | OdometryError::DegenerateGeometry(_)
        )
    }
}
