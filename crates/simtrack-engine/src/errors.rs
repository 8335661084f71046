use simtrack_core::estimate::EstimateError;
use simtrack_core::solve::SolveError;
use thiserror::Error;

/// Errors surfaced by the per-frame tracking driver.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Rejected at construction; tracking never starts.
    #[error("invalid tracker configuration: {0}")]
    InvalidConfig(String),

    /// The pairwise estimator's closed-form solve failed for this frame.
    /// Recoverable estimation failures (too few inliers, degenerate
    /// samples) never surface here; they fall back to identity internally.
    #[error("pairwise estimation failed: {0}")]
    Estimate(#[from] EstimateError),

    /// Bundle adjustment failed for the window that just closed. The
    /// tracker has already fallen back to the unrefined chained estimate
    /// for anchor continuity; only this window's refinement is lost.
    #[error("window refinement failed: {0}")]
    Solve(#[from] SolveError),
}

pub type Result<T> = std::result::Result<T, TrackError>;
