use serde::{Deserialize, Serialize};
use simtrack_core::estimate::RansacParams;
use simtrack_core::solve::SolverConfig;
use simtrack_core::window::WindowConfig;

use crate::errors::TrackError;

/// Tracker configuration, loadable from JSON/YAML by the embedding
/// application. Every field has a default so partial configs deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frame coverage below which a key frame is requested.
    pub area_ratio_threshold: f64,
    /// Agreement below which a direct key-frame track is discarded.
    pub propagation_threshold: f64,
    /// Hard cap on frames per window.
    pub max_window_frames: usize,
    pub ransac: RansacSettings,
    pub solver: SolverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacSettings {
    pub max_iterations: usize,
    pub min_iterations: usize,
    pub confidence: f64,
    pub inlier_threshold: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub rounds: usize,
    pub max_iterations: usize,
    pub error_cap: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            frame_width: 640,
            frame_height: 480,
            area_ratio_threshold: 0.6,
            propagation_threshold: 0.95,
            max_window_frames: 30,
            ransac: RansacSettings::default(),
            solver: SolverSettings::default(),
        }
    }
}

impl Default for RansacSettings {
    fn default() -> Self {
        let params = RansacParams::default();
        Self {
            max_iterations: params.max_iterations,
            min_iterations: params.min_iterations,
            confidence: params.confidence,
            inlier_threshold: params.inlier_threshold,
            seed: params.seed,
        }
    }
}

impl Default for SolverSettings {
    fn default() -> Self {
        let config = SolverConfig::default();
        Self {
            rounds: config.rounds,
            max_iterations: config.max_iterations,
            error_cap: config.error_cap,
        }
    }
}

impl TrackerConfig {
    /// Startup validation; a tracker is never built from a bad config.
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(TrackError::InvalidConfig(format!(
                "frame dimensions must be positive, got {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        for (name, value) in [
            ("area_ratio_threshold", self.area_ratio_threshold),
            ("propagation_threshold", self.propagation_threshold),
            ("ransac.confidence", self.ransac.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) || value == 0.0 {
                return Err(TrackError::InvalidConfig(format!(
                    "{name} must lie in (0, 1], got {value}"
                )));
            }
        }
        if self.ransac.min_iterations > self.ransac.max_iterations {
            return Err(TrackError::InvalidConfig(format!(
                "ransac.min_iterations ({}) must not exceed ransac.max_iterations ({})",
                self.ransac.min_iterations, self.ransac.max_iterations
            )));
        }
        if self.max_window_frames < 2 {
            return Err(TrackError::InvalidConfig(format!(
                "max_window_frames must be at least 2, got {}",
                self.max_window_frames
            )));
        }
        if self.solver.rounds == 0 {
            return Err(TrackError::InvalidConfig(
                "solver.rounds must be at least 1".into(),
            ));
        }
        if self.solver.error_cap <= 0.0 {
            return Err(TrackError::InvalidConfig(format!(
                "solver.error_cap must be positive, got {}",
                self.solver.error_cap
            )));
        }
        Ok(())
    }

    /// Normalization scale for residual thresholds, derived from the frame
    /// diagonal so thresholds track resolution.
    pub fn norm_scale(&self) -> f64 {
        (self.frame_width as f64).hypot(self.frame_height as f64) / 1000.0
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            area_ratio_threshold: self.area_ratio_threshold,
            propagation_threshold: self.propagation_threshold,
            max_window_frames: self.max_window_frames,
        }
    }

    pub fn ransac_params(&self) -> RansacParams {
        RansacParams {
            max_iterations: self.ransac.max_iterations,
            min_iterations: self.ransac.min_iterations,
            confidence: self.ransac.confidence,
            inlier_threshold: self.ransac.inlier_threshold,
            seed: self.ransac.seed,
            ..RansacParams::default()
        }
    }

    pub fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            rounds: self.solver.rounds,
            max_iterations: self.solver.max_iterations,
            error_cap: self.solver.error_cap,
            ..SolverConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let config = TrackerConfig {
            frame_width: 0,
            ..TrackerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TrackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let config = TrackerConfig {
            area_ratio_threshold: 1.5,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_ransac_iteration_bounds_are_rejected() {
        let config = TrackerConfig {
            ransac: RansacSettings {
                min_iterations: 500,
                max_iterations: 200,
                ..RansacSettings::default()
            },
            ..TrackerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TrackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn norm_scale_tracks_resolution() {
        let small = TrackerConfig::default().norm_scale();
        let large = TrackerConfig {
            frame_width: 1920,
            frame_height: 1080,
            ..TrackerConfig::default()
        }
        .norm_scale();
        assert!(large > small);
    }
}
