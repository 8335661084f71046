//! Window accumulation and the key-frame drift heuristic.
//!
//! A window spans the frames since the last key frame. Each processed frame
//! appends its pairwise estimates, extends the running concatenated model,
//! and is checked for geometric drift: when the frame rectangle mapped
//! through the chain overlaps too little of the original rectangle, the
//! next frame should become a key frame and close the window.

use log::{debug, warn};

use crate::estimate::FrameMatch;
use crate::math::polygon::{clip_convex, polygon_area, rect_corners};
use crate::math::similarity::Similarity2;

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Minimum fraction of the frame still covered by the chained transform
    /// before a key frame is requested.
    pub area_ratio_threshold: f64,
    /// Minimum agreement between the chained transform and a direct
    /// key-frame track before the direct track is discarded.
    pub propagation_threshold: f64,
    /// Hard cap on window length; the window closes when reached.
    pub max_window_frames: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            area_ratio_threshold: 0.6,
            propagation_threshold: 0.95,
            max_window_frames: 30,
        }
    }
}

/// Accumulated per-window state, threaded explicitly through each per-frame
/// call. Frame 0 of the window is the key frame itself and carries no match
/// list.
#[derive(Debug, Clone, Default)]
pub struct WindowState {
    /// One list of pairwise estimates per frame since the key frame.
    pub frames: Vec<Vec<FrameMatch>>,
    /// Concatenation of the per-frame models: maps current-frame
    /// coordinates into key-frame coordinates.
    pub chained: Similarity2,
    /// Frames appended since the key frame.
    pub frames_since_key: usize,
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key-frame transition: drops the accumulated matches and restarts the
    /// chain at identity. The caller consumes `frames` (bundle adjustment)
    /// before resetting.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.chained = Similarity2::identity();
        self.frames_since_key = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Outcome of appending one frame to the window.
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdate {
    /// Fraction of the frame rectangle still covered under the chained
    /// transform.
    pub area_ratio: f64,
    /// The drift heuristic asks the upstream tracker to make the next frame
    /// a key frame.
    pub request_key_frame: bool,
    /// The direct key-frame track disagreed with the chain and was dropped.
    pub dropped_direct_match: bool,
    /// The window is complete and ready for bundle adjustment.
    pub close_window: bool,
}

pub struct WindowManager {
    config: WindowConfig,
}

impl WindowManager {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Appends one frame's pairwise estimates and evaluates the key-frame
    /// heuristic. `key_frame_signaled` marks an externally forced key frame
    /// for this frame.
    pub fn advance(
        &self,
        state: &mut WindowState,
        mut matches: Vec<FrameMatch>,
        frame_width: f64,
        frame_height: f64,
        key_frame_signaled: bool,
    ) -> WindowUpdate {
        let newest = matches
            .iter()
            .min_by_key(|m| m.matched_frame_offset)
            .map(|m| m.model)
            .unwrap_or_else(Similarity2::identity);
        let chained = state.chained.concat(&newest);

        let frame_area = frame_width * frame_height;
        let original = rect_corners(&Similarity2::identity(), frame_width, frame_height);
        let mapped = rect_corners(&chained, frame_width, frame_height);
        let overlap = polygon_area(&clip_convex(&mapped, &original)).max(0.0);
        let area_ratio = overlap / frame_area;

        // Cross-check against a direct track to the key frame, when the
        // upstream tracker supplied one.
        let mut dropped_direct_match = false;
        let direct_offset = state.frames_since_key + 1;
        if direct_offset > 1 {
            if let Some(pos) = matches
                .iter()
                .position(|m| m.matched_frame_offset == direct_offset)
            {
                let direct = matches[pos].model;
                let direct_poly = rect_corners(&direct, frame_width, frame_height);
                let chained_area = polygon_area(&mapped).max(f64::EPSILON);
                let agreement =
                    polygon_area(&clip_convex(&mapped, &direct_poly)).max(0.0) / chained_area;
                if agreement < self.config.propagation_threshold {
                    warn!(
                        "Direct key-frame track disagrees with the chain \
                         (agreement {:.3} < {:.3}); dropping it",
                        agreement, self.config.propagation_threshold
                    );
                    matches.remove(pos);
                    dropped_direct_match = true;
                }
            }
        }

        state.chained = chained;
        state.frames.push(matches);
        state.frames_since_key += 1;

        let request_key_frame =
            area_ratio < self.config.area_ratio_threshold && !key_frame_signaled;
        if request_key_frame {
            debug!(
                "Frame area ratio {:.3} below {:.3}; requesting a key frame",
                area_ratio, self.config.area_ratio_threshold
            );
        }

        let close_window =
            key_frame_signaled || state.frames_since_key >= self.config.max_window_frames;

        WindowUpdate {
            area_ratio,
            request_key_frame,
            dropped_direct_match,
            close_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    const W: f64 = 100.0;
    const H: f64 = 80.0;

    fn pairwise(model: Similarity2, offset: usize) -> FrameMatch {
        FrameMatch {
            model,
            matched_frame_offset: offset,
            ..FrameMatch::identity(offset, Vec::new())
        }
    }

    #[test]
    fn small_motion_keeps_collecting() {
        let manager = WindowManager::new(WindowConfig::default());
        let mut state = WindowState::new();

        let shift = Similarity2::new(1.0, 0.0, Vector2::new(2.0, 0.0));
        let update = manager.advance(&mut state, vec![pairwise(shift, 1)], W, H, false);

        assert!(update.area_ratio > 0.9);
        assert!(!update.request_key_frame);
        assert!(!update.close_window);
        assert_eq!(state.frames_since_key, 1);
    }

    #[test]
    fn drift_raises_then_clears_key_frame_request() {
        let manager = WindowManager::new(WindowConfig::default());
        let mut state = WindowState::new();

        // Shift most of the frame out of view.
        let big = Similarity2::new(1.0, 0.0, Vector2::new(0.8 * W, 0.0));
        let update = manager.advance(&mut state, vec![pairwise(big, 1)], W, H, false);
        assert!(update.area_ratio < 0.3);
        assert!(update.request_key_frame);

        // Shift back; overlap is restored and the request clears.
        let update = manager.advance(&mut state, vec![pairwise(big.inverse(), 1)], W, H, false);
        assert!(update.area_ratio > 0.95);
        assert!(!update.request_key_frame);
    }

    #[test]
    fn external_signal_suppresses_request_and_closes() {
        let manager = WindowManager::new(WindowConfig::default());
        let mut state = WindowState::new();

        let big = Similarity2::new(1.0, 0.0, Vector2::new(0.8 * W, 0.0));
        let update = manager.advance(&mut state, vec![pairwise(big, 1)], W, H, true);
        assert!(!update.request_key_frame);
        assert!(update.close_window);
    }

    #[test]
    fn disagreeing_direct_track_is_dropped() {
        let manager = WindowManager::new(WindowConfig::default());
        let mut state = WindowState::new();

        let step = Similarity2::new(1.0, 0.0, Vector2::new(3.0, 0.0));
        manager.advance(&mut state, vec![pairwise(step, 1)], W, H, false);

        // Second frame: consistent frame-to-frame step, wildly different
        // direct track to the key frame.
        let bogus_direct = Similarity2::new(1.0, 0.0, Vector2::new(50.0, 30.0));
        let update = manager.advance(
            &mut state,
            vec![pairwise(step, 1), pairwise(bogus_direct, 2)],
            W,
            H,
            false,
        );

        assert!(update.dropped_direct_match);
        assert_eq!(state.frames[1].len(), 1);
        assert_eq!(state.frames[1][0].matched_frame_offset, 1);
    }

    #[test]
    fn consistent_direct_track_is_kept() {
        let manager = WindowManager::new(WindowConfig::default());
        let mut state = WindowState::new();

        let step = Similarity2::new(1.0, 0.0, Vector2::new(3.0, 0.0));
        manager.advance(&mut state, vec![pairwise(step, 1)], W, H, false);

        let direct = step.concat(&step);
        let update = manager.advance(
            &mut state,
            vec![pairwise(step, 1), pairwise(direct, 2)],
            W,
            H,
            false,
        );

        assert!(!update.dropped_direct_match);
        assert_eq!(state.frames[1].len(), 2);
    }

    #[test]
    fn window_closes_at_max_length() {
        let config = WindowConfig {
            max_window_frames: 3,
            ..WindowConfig::default()
        };
        let manager = WindowManager::new(config);
        let mut state = WindowState::new();

        let step = Similarity2::new(1.0, 0.0, Vector2::new(1.0, 0.0));
        for i in 0..3 {
            let update = manager.advance(&mut state, vec![pairwise(step, 1)], W, H, false);
            assert_eq!(update.close_window, i == 2);
        }

        state.reset();
        assert!(state.is_empty());
        assert_eq!(state.frames_since_key, 0);
    }
}
