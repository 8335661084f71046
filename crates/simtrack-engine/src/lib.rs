//! Frame-at-a-time driver for similarity-motion tracking.
//!
//! Wires the pairwise estimator, window/key-frame manager, and
//! bundle-adjustment solver from `simtrack-core` into a synchronous
//! per-frame pipeline: each frame's region correspondences are processed to
//! completion before the next frame is accepted. State is carried in an
//! explicit [`TrackerState`] owned by the caller, so the key-frame reset
//! transition is visible and testable.

pub mod config;
pub mod errors;

use log::{debug, info, warn};
use simtrack_core::estimate::{
    EstimateError, FrameMatch, PairwiseEstimator, RegionCorrespondence,
};
use simtrack_core::math::similarity::Similarity2;
use simtrack_core::solve::{BundleAdjuster, CorrespondenceGraph, WindowSolution};
use simtrack_core::window::{WindowManager, WindowState};

pub use config::TrackerConfig;
pub use errors::{Result, TrackError};

/// Correspondences for one incoming frame: zero or more matched past
/// frames, each identified by how many frames back it lies.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    pub matches: Vec<(usize, Vec<RegionCorrespondence>)>,
    /// The upstream tracker declared this frame a key frame (forced
    /// periodic key-framing, or honoring our own request from the previous
    /// frame).
    pub is_key_frame: bool,
}

/// Per-frame result handed back to the caller.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    /// This frame's transform into the global origin (anchored through
    /// every previous window).
    pub model: Similarity2,
    /// Region partition of the newest pairwise estimate, for the
    /// downstream foreground-propagation stage.
    pub inlier_regions: Vec<u32>,
    pub outlier_regions: Vec<u32>,
    /// Drift heuristic feedback: the next frame should be a key frame.
    pub request_key_frame: bool,
    /// Present when this frame closed a window: the jointly refined,
    /// anchor-concatenated transforms for every frame in it.
    pub refined_window: Option<WindowSolution>,
}

/// All state carried across frames. Exactly one writer; reset at each key
/// frame via [`TrackerState::rebase`].
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub window: WindowState,
    /// Maps key-frame coordinates into the global origin; carried forward
    /// from the previous window's last refined transform.
    pub anchor: Similarity2,
    pub frame_index: u64,
}

impl TrackerState {
    pub fn new() -> Self {
        Self {
            window: WindowState::new(),
            anchor: Similarity2::identity(),
            frame_index: 0,
        }
    }

    /// Key-frame transition: the closed window is discarded and the new
    /// window is anchored at `anchor` (the key frame's global transform).
    pub fn rebase(&mut self, anchor: Similarity2) {
        self.anchor = anchor;
        self.window.reset();
    }
}

impl Default for TrackerState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MotionTracker {
    config: TrackerConfig,
    estimator: PairwiseEstimator,
    windows: WindowManager,
    adjuster: BundleAdjuster,
}

impl MotionTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Motion tracker configured for {}x{} frames, window cap {}",
            config.frame_width, config.frame_height, config.max_window_frames
        );
        Ok(Self {
            estimator: PairwiseEstimator::new(config.ransac_params()),
            windows: WindowManager::new(config.window_config()),
            adjuster: BundleAdjuster::new(config.solver_config()),
            config,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Processes one frame to completion: pairwise estimation per matched
    /// past frame, window update, key-frame heuristic, and (when the window
    /// closes) synchronous bundle adjustment.
    ///
    /// Recoverable estimation failures fall back to an identity match so
    /// tracking keeps advancing. A failed window refinement returns
    /// [`TrackError::Solve`] after rebasing onto the unrefined chained
    /// estimate, so subsequent frames stay continuous.
    pub fn advance(&self, state: &mut TrackerState, input: FrameInput) -> Result<FrameOutput> {
        let frame_index = state.frame_index;
        state.frame_index += 1;

        let mut frame_matches = Vec::with_capacity(input.matches.len());
        for (offset, regions) in input.matches {
            match self
                .estimator
                .estimate(regions, self.config.norm_scale(), offset)
            {
                Ok(frame_match) => frame_matches.push(frame_match),
                Err(EstimateError::ModelEstimation) => {
                    warn!(
                        "Frame {}: estimation against offset {} failed; \
                         falling back to identity",
                        frame_index, offset
                    );
                    frame_matches.push(FrameMatch::identity(offset, Vec::new()));
                }
                Err(err @ EstimateError::Solver) => return Err(err.into()),
            }
        }

        let update = self.windows.advance(
            &mut state.window,
            frame_matches,
            self.config.frame_width as f64,
            self.config.frame_height as f64,
            input.is_key_frame,
        );

        let newest = state
            .window
            .frames
            .last()
            .and_then(|matches| newest_match(matches));
        let inlier_regions = newest.map_or(Vec::new(), |m| m.inlier_regions.clone());
        let outlier_regions = newest.map_or(Vec::new(), |m| m.outlier_regions.clone());

        let mut model = state.anchor.concat(&state.window.chained);
        let mut refined_window = None;

        if update.close_window {
            debug!(
                "Frame {}: window closed with {} frames, running bundle adjustment",
                frame_index,
                state.window.frames.len()
            );
            let graph = CorrespondenceGraph::from_window(&state.window.frames);
            let initial = initial_models(&state.window.frames);
            match self.adjuster.solve(&graph, &initial, &state.anchor) {
                Ok(solution) => {
                    // models always holds at least the key-frame entry.
                    let new_anchor = solution.models.last().copied().unwrap_or(state.anchor);
                    model = new_anchor;
                    refined_window = Some(solution);
                    state.rebase(new_anchor);
                }
                Err(err) => {
                    warn!(
                        "Frame {}: window refinement failed ({}); \
                         keeping the chained estimate",
                        frame_index, err
                    );
                    state.rebase(model);
                    return Err(err.into());
                }
            }
        }

        Ok(FrameOutput {
            model,
            inlier_regions,
            outlier_regions,
            request_key_frame: update.request_key_frame,
            refined_window,
        })
    }
}

/// The match against the nearest past frame.
fn newest_match(matches: &[FrameMatch]) -> Option<&FrameMatch> {
    matches.iter().min_by_key(|m| m.matched_frame_offset)
}

/// Initial solver models in the key-to-frame direction, chained from the
/// per-frame pairwise estimates (index 0 is the key frame).
fn initial_models(frames: &[Vec<FrameMatch>]) -> Vec<Similarity2> {
    let mut models = Vec::with_capacity(frames.len() + 1);
    models.push(Similarity2::identity());
    let mut chain = Similarity2::identity();
    for matches in frames {
        let step = newest_match(matches)
            .map(|m| m.model)
            .unwrap_or_else(Similarity2::identity);
        chain = chain.concat(&step);
        models.push(chain.inverse());
    }
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Vector2};
    use simtrack_core::estimate::FeatureCorrespondence;

    fn regions_for_motion(model: &Similarity2) -> Vec<RegionCorrespondence> {
        (0..6)
            .map(|k| {
                let origin = Point2::new(60.0 + 90.0 * (k % 3) as f64, 60.0 + 150.0 * (k / 3) as f64);
                let features = (0..9)
                    .map(|f| {
                        let p = Point2::new(
                            origin.x + 12.0 * (f % 3) as f64,
                            origin.y + 12.0 * (f / 3) as f64,
                        );
                        FeatureCorrespondence::new(p, model.transform_point(&p) - p, 1.0)
                    })
                    .collect();
                RegionCorrespondence::from_features(k as u32, features)
            })
            .collect()
    }

    #[test]
    fn rejects_bad_config_at_startup() {
        let config = TrackerConfig {
            frame_width: 0,
            ..TrackerConfig::default()
        };
        assert!(matches!(
            MotionTracker::new(config),
            Err(TrackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tracks_a_constant_drift() {
        let tracker = MotionTracker::new(TrackerConfig::default()).expect("tracker");
        let mut state = TrackerState::new();

        let step = Similarity2::new(1.0, 0.0, Vector2::new(2.0, 1.0));
        let mut expected = Similarity2::identity();
        for _ in 0..4 {
            let input = FrameInput {
                matches: vec![(1, regions_for_motion(&step))],
                is_key_frame: false,
            };
            let output = tracker.advance(&mut state, input).expect("advance");
            expected = expected.concat(&step);
            assert_relative_eq!(output.model.translation, expected.translation, epsilon = 1e-6);
            assert_eq!(output.inlier_regions.len(), 6);
            assert!(output.refined_window.is_none());
        }
        assert_eq!(state.frame_index, 4);
    }

    #[test]
    fn recoverable_estimation_failure_falls_back_to_identity() {
        let tracker = MotionTracker::new(TrackerConfig::default()).expect("tracker");
        let mut state = TrackerState::new();

        let input = FrameInput {
            matches: vec![(1, Vec::new())],
            is_key_frame: false,
        };
        let output = tracker.advance(&mut state, input).expect("advance");
        assert_eq!(output.model, Similarity2::identity());
        assert!(output.inlier_regions.is_empty());
    }

    #[test]
    fn key_frame_closes_and_refines_the_window() {
        let tracker = MotionTracker::new(TrackerConfig::default()).expect("tracker");
        let mut state = TrackerState::new();

        let step = Similarity2::new(1.0, 0.02, Vector2::new(3.0, -1.0));
        for frame in 0..3 {
            let input = FrameInput {
                matches: vec![(1, regions_for_motion(&step))],
                is_key_frame: frame == 2,
            };
            let output = tracker.advance(&mut state, input).expect("advance");
            if frame == 2 {
                let solution = output.refined_window.expect("refined window");
                assert_eq!(solution.models.len(), 4);
                assert_eq!(solution.models[0], Similarity2::identity());
                // The tracker rebased onto the refined key-frame transform.
                assert_eq!(output.model, *solution.models.last().unwrap());
                assert!(state.window.is_empty());
            } else {
                assert!(output.refined_window.is_none());
            }
        }
        assert_relative_eq!(
            state.anchor.rotation,
            3.0 * 0.02,
            epsilon = 1e-4
        );
    }
}
