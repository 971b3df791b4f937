//! Configuration for the landmark core.
//!
//! Every field has a default, so a TOML file only needs to list the values
//! it overrides:
//!
//! ```toml
//! [point]
//! default_depth = 2.0
//!
//! [refiner]
//! min_keyframes = 3
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    pub point: PointConfig,
    pub refiner: RefinerConfig,
    pub mapper: MapperConfig,
}

/// Per-landmark priors and depth-fusion parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PointConfig {
    /// Depth assigned to a freshly created (guessed) landmark.
    pub default_depth: f64,

    /// Initial variance of the two metric pixel components of the state.
    pub homogeneous_variance: f64,

    /// Initial variance of the depth component of the state.
    pub depth_variance: f64,

    /// Maximum number of observation references kept per landmark.
    pub max_observations: usize,

    /// Variance of a metric pixel measurement, used to derive fusion noise.
    pub pixel_noise_variance: f64,

    /// Minimum ray parallax (degrees) for a two-view depth measurement.
    pub min_parallax_deg: f64,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            default_depth: 1.0,
            homogeneous_variance: 1e-4,
            depth_variance: 10.0,
            max_observations: 100,
            pixel_noise_variance: 1e-6,
            min_parallax_deg: 0.5,
        }
    }
}

/// Structure-only bundle adjustment parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RefinerConfig {
    /// Gauss-Newton iteration budget.
    pub max_iterations: usize,

    /// Fewer keyframe observations than this fails fast.
    pub min_keyframes: usize,

    /// Keyframe search stops once this many are collected.
    pub max_keyframes: usize,

    /// Stop iterating once the step norm falls to this value.
    pub convergence_eps: f64,

    /// Maximum accepted mean squared reprojection error (metric pixels²).
    pub max_variance: f64,

    /// Accepted depth range in the newest keyframe (exclusive).
    pub min_depth: f64,
    pub max_depth: f64,

    /// A failure at an iteration below this index rejects the result.
    pub early_failure_window: usize,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_keyframes: 2,
            max_keyframes: 5,
            convergence_eps: 1e-10,
            max_variance: 1e-4,
            min_depth: 0.1,
            max_depth: 100.0,
            early_failure_window: 2,
        }
    }
}

/// Mapper thread parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Number of frames retained in the frame buffer.
    pub frame_buffer_size: usize,

    /// Run the refinement pass every N keyframes.
    pub refine_interval: usize,

    /// Capacity of the frame channel feeding the mapper.
    pub channel_capacity: usize,

    /// A guessed landmark observed this many times without a depth update
    /// is flagged obsolete.
    pub max_stale_frames: u32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            frame_buffer_size: 20,
            refine_interval: 1,
            channel_capacity: 8,
            max_stale_frames: 30,
        }
    }
}

impl LandmarkConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LandmarkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check the invariants the estimators rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.point;
        if !(p.default_depth > 0.0) {
            return Err(invalid("point.default_depth must be positive"));
        }
        if !(p.homogeneous_variance > 0.0 && p.depth_variance > 0.0) {
            return Err(invalid("point variances must be positive"));
        }
        if !(p.pixel_noise_variance > 0.0) {
            return Err(invalid("point.pixel_noise_variance must be positive"));
        }
        if p.max_observations == 0 {
            return Err(invalid("point.max_observations must be at least 1"));
        }

        let r = &self.refiner;
        if r.min_keyframes < 2 {
            return Err(invalid("refiner.min_keyframes must be at least 2"));
        }
        if r.max_keyframes < r.min_keyframes {
            return Err(invalid("refiner.max_keyframes must be >= min_keyframes"));
        }
        if r.max_iterations == 0 {
            return Err(invalid("refiner.max_iterations must be at least 1"));
        }
        if !(r.min_depth >= 0.0 && r.max_depth > r.min_depth) {
            return Err(invalid("refiner depth range is empty"));
        }

        let m = &self.mapper;
        if m.frame_buffer_size == 0 || m.channel_capacity == 0 || m.refine_interval == 0 {
            return Err(invalid(
                "mapper buffer size, channel capacity and refine interval must be nonzero",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(LandmarkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LandmarkConfig::from_toml_str(
            r#"
            [point]
            default_depth = 2.5

            [refiner]
            min_keyframes = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.point.default_depth, 2.5);
        assert_eq!(config.point.max_observations, 100);
        assert_eq!(config.refiner.min_keyframes, 3);
        assert_eq!(config.refiner.max_keyframes, 5);
        assert_eq!(config.mapper.frame_buffer_size, 20);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = LandmarkConfig::from_toml_str("[refiner]\nmin_keyframes = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = LandmarkConfig::from_toml_str("[point]\ndepth_variance = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = LandmarkConfig::from_toml_str("[point\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
