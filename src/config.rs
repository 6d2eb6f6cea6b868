// config.rs — Tuning parameters as immutable value objects.
//
// `OdometryConfig` bundles the detector, tracker and pose-estimator
// settings plus the engine's re-detection threshold. It can be built from
// defaults, deserialized with serde, or read from flat key-value pairs:
//
//   max_corners = 500          min_tracked_features = 100
//   window_size = 10           ransac_threshold     = 1.0
//
// Keys that are absent keep their default. Unknown keys are logged and
// ignored. Intrinsics live in the same flat namespace but are read by
// `CameraIntrinsics::from_key_values`.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::camera::INTRINSIC_KEYS;
use crate::corners::DetectorConfig;
use crate::error::ConfigError;
use crate::essential::EssentialSolver;
use crate::klt::{LkMethod, TrackerConfig};
use crate::pose::PoseConfig;

/// Flat key-value configuration as supplied by an external config source.
pub type KeyValues = BTreeMap<String, String>;

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub pose: PoseConfig,
    /// Re-detect when the previous frame kept this many features or fewer.
    pub min_tracked_features: usize,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        OdometryConfig {
            detector: DetectorConfig::default(),
            tracker: TrackerConfig::default(),
            pose: PoseConfig::default(),
            min_tracked_features: 100,
        }
    }
}

const TUNING_KEYS: &[&str] = &[
    "max_corners",
    "quality_level",
    "min_distance",
    "block_size",
    "use_harris",
    "harris_k",
    "window_size",
    "pyramid_levels",
    "max_iterations",
    "epsilon",
    "lk_method",
    "ransac_threshold",
    "ransac_confidence",
    "ransac_max_iterations",
    "ransac_seed",
    "solver",
    "min_inlier_ratio",
    "min_parallax",
    "min_tracked_features",
];

impl OdometryConfig {
    /// Build a configuration from flat key-value pairs, starting from the
    /// defaults.
    pub fn from_key_values(values: &KeyValues) -> Result<Self, ConfigError> {
        for key in values.keys() {
            let known = TUNING_KEYS.contains(&key.as_str()) || INTRINSIC_KEYS.contains(&key.as_str());
            if !known {
                warn!("ignoring unknown configuration key `{key}`");
            }
        }

        let mut config = OdometryConfig::default();

        let d = &mut config.detector;
        override_with(values, "max_corners", &mut d.max_corners)?;
        override_with(values, "quality_level", &mut d.quality_level)?;
        override_with(values, "min_distance", &mut d.min_distance)?;
        override_with(values, "block_size", &mut d.block_size)?;
        override_with(values, "use_harris", &mut d.use_harris)?;
        override_with(values, "harris_k", &mut d.harris_k)?;

        let t = &mut config.tracker;
        override_with(values, "window_size", &mut t.window_size)?;
        override_with(values, "pyramid_levels", &mut t.pyramid_levels)?;
        override_with(values, "max_iterations", &mut t.max_iterations)?;
        override_with(values, "epsilon", &mut t.epsilon)?;
        if let Some(method) = values.get("lk_method") {
            t.method = match method.trim() {
                "forward_additive" => LkMethod::ForwardAdditive,
                "inverse_compositional" => LkMethod::InverseCompositional,
                other => return Err(invalid("lk_method", other, "expected forward_additive or inverse_compositional")),
            };
        }

        let p = &mut config.pose;
        override_with(values, "ransac_threshold", &mut p.threshold_px)?;
        override_with(values, "ransac_confidence", &mut p.confidence)?;
        override_with(values, "ransac_max_iterations", &mut p.max_iterations)?;
        override_with(values, "ransac_seed", &mut p.seed)?;
        override_with(values, "min_inlier_ratio", &mut p.min_inlier_ratio)?;
        override_with(values, "min_parallax", &mut p.min_parallax_px)?;
        if let Some(solver) = values.get("solver") {
            p.solver = match solver.trim() {
                "five_point" => EssentialSolver::FivePoint,
                "eight_point" => EssentialSolver::EightPoint,
                other => return Err(invalid("solver", other, "expected five_point or eight_point")),
            };
        }

        override_with(values, "min_tracked_features", &mut config.min_tracked_features)?;

        config.validate()?;
        Ok(config)
    }

    /// Check ranges that the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        require_positive("quality_level", d.quality_level as f64)?;
        if d.quality_level > 1.0 {
            return Err(invalid("quality_level", d.quality_level, "must not exceed 1"));
        }
        require_non_negative("min_distance", d.min_distance as f64)?;
        require_positive("block_size", d.block_size as f64)?;
        if d.block_size % 2 == 0 {
            return Err(invalid("block_size", d.block_size, "must be odd"));
        }
        require_non_negative("harris_k", d.harris_k as f64)?;

        let t = &self.tracker;
        require_positive("window_size", t.window_size as f64)?;
        require_positive("pyramid_levels", t.pyramid_levels as f64)?;
        require_positive("max_iterations", t.max_iterations as f64)?;
        require_positive("epsilon", t.epsilon as f64)?;

        let p = &self.pose;
        require_positive("ransac_threshold", p.threshold_px)?;
        require_positive("ransac_max_iterations", p.max_iterations as f64)?;
        if !(p.confidence > 0.0 && p.confidence < 1.0) {
            return Err(invalid("ransac_confidence", p.confidence, "must lie strictly between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&p.min_inlier_ratio) {
            return Err(invalid("min_inlier_ratio", p.min_inlier_ratio, "must lie in [0, 1]"));
        }
        require_finite("min_parallax", p.min_parallax_px)?;
        Ok(())
    }
}

/// Parse `key` if present and overwrite `slot`.
pub(crate) fn override_with<T>(values: &KeyValues, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(parsed) = parse_optional(values, key)? {
        *slot = parsed;
    }
    Ok(())
}

pub(crate) fn parse_optional<T>(values: &KeyValues, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match values.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, raw, e)),
    }
}

/// Parse a float that must be present and finite.
pub(crate) fn parse_required_f64(values: &KeyValues, key: &str) -> Result<f64, ConfigError> {
    let value = parse_optional::<f64>(values, key)?.ok_or_else(|| ConfigError::Missing(key.to_string()))?;
    require_finite(key, value)?;
    Ok(value)
}

pub(crate) fn require_finite(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotFinite { key: key.to_string(), value })
    }
}

pub(crate) fn require_positive(key: &str, value: f64) -> Result<(), ConfigError> {
    require_finite(key, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { key: key.to_string(), value })
    }
}

fn require_non_negative(key: &str, value: f64) -> Result<(), ConfigError> {
    require_finite(key, value)?;
    if value < 0.0 {
        return Err(invalid(key, value, "must not be negative"));
    }
    Ok(())
}

fn invalid(key: &str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
