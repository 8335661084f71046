//! Robust pairwise motion estimation.
//!
//! Fits one [`Similarity2`] per matched frame pair from a set of region
//! correspondences, RANSAC-style: sample a few regions, fit a linear
//! similarity constraint to their pooled features, vote regions in or out,
//! then refit the winner in closed form (Umeyama).

pub mod correspondence;

use log::{debug, trace};
use nalgebra::{DMatrix, DVector, Matrix2, Point2, Vector2};
use rand::rngs::SmallRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use thiserror::Error;

use crate::math::similarity::Similarity2;
pub use correspondence::{FeatureCorrespondence, FrameMatch, RegionCorrespondence};

#[derive(Debug, Error)]
pub enum EstimateError {
    /// Too few usable correspondences or RANSAC exhausted its degenerate
    /// sample budget. Recoverable: callers substitute identity and keep
    /// tracking.
    #[error("could not estimate a motion model from the supplied correspondences")]
    ModelEstimation,
    /// The SVD inside the closed-form fit did not converge.
    #[error("SVD did not converge in the closed-form similarity fit")]
    Solver,
}

#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    /// Upper bound on sampling iterations before adaptation.
    pub max_iterations: usize,
    /// Floor for the adaptively shrunk iteration budget.
    pub min_iterations: usize,
    /// Regions pooled into each minimal sample.
    pub sample_regions: usize,
    /// Inlier threshold as a fraction of the error scale.
    pub inlier_threshold: f64,
    /// Fraction of a region's features that must conform for the region to
    /// count as an inlier.
    pub region_inlier_fraction: f64,
    /// Target probability of having drawn an all-inlier sample.
    pub confidence: f64,
    /// Degenerate samples tolerated before giving up.
    pub max_degenerate_tries: usize,
    /// RNG seed; estimation is deterministic for a fixed seed and input.
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            min_iterations: 10,
            sample_regions: 3,
            inlier_threshold: 0.3,
            region_inlier_fraction: 2.0 / 3.0,
            confidence: 0.99,
            max_degenerate_tries: 1000,
            seed: 0x7362_7472,
        }
    }
}

/// One scored RANSAC hypothesis.
struct Candidate {
    model: Similarity2,
    score: usize,
    region_inlier: Vec<bool>,
    mean_residuals: Vec<f64>,
}

pub struct PairwiseEstimator {
    params: RansacParams,
}

impl PairwiseEstimator {
    pub fn new(params: RansacParams) -> Self {
        Self { params }
    }

    /// Estimates the similarity motion between the current frame and a frame
    /// `frame_distance` steps back.
    ///
    /// `norm_scale` is the frame's normalization scale; together with
    /// `frame_distance` and a robust average-motion estimate it sets the
    /// inlier distance threshold, since farther-apart frames tolerate larger
    /// nominal motion.
    pub fn estimate(
        &self,
        regions: Vec<RegionCorrespondence>,
        norm_scale: f64,
        frame_distance: usize,
    ) -> Result<FrameMatch, EstimateError> {
        let usable: Vec<usize> = regions
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.features.is_empty())
            .map(|(i, _)| i)
            .collect();
        let total_features: usize = usable.iter().map(|&i| regions[i].features.len()).sum();

        debug!(
            "Estimating pairwise motion: {} regions ({} usable, {} features), distance {}",
            regions.len(),
            usable.len(),
            total_features,
            frame_distance
        );

        if usable.is_empty() {
            return Err(EstimateError::ModelEstimation);
        }

        let threshold = self.inlier_distance_threshold(&regions, &usable, norm_scale, frame_distance);

        let best = if usable.len() <= self.params.sample_regions {
            // Too few regions to sample from; fit every usable feature once.
            let pairs = pool_pairs(&regions, &usable);
            fit_linear_similarity(&pairs)
                .map(|model| {
                    score_candidate(&model, &regions, threshold, self.params.region_inlier_fraction)
                })
                .ok_or(EstimateError::ModelEstimation)?
        } else {
            self.search(&regions, &usable, total_features, threshold, |_| {})?
        };

        let mut inlier_regions = Vec::new();
        let mut outlier_regions = Vec::new();
        let mut inlier_scores = Vec::new();
        for (idx, region) in regions.iter().enumerate() {
            if best.region_inlier[idx] {
                inlier_regions.push(region.region_id);
                let score = (1.0 - best.mean_residuals[idx] / threshold).clamp(0.0, 1.0);
                inlier_scores.push(score);
            } else {
                outlier_regions.push(region.region_id);
            }
        }

        // Refit over the conforming features of the inlier regions.
        let mut pairs = Vec::new();
        for (idx, region) in regions.iter().enumerate() {
            if !best.region_inlier[idx] {
                continue;
            }
            for f in &region.features {
                if residual(&best.model, f) < threshold {
                    pairs.push((f.location, f.matched_location(), f.weight));
                }
            }
        }
        if pairs.is_empty() {
            return Err(EstimateError::ModelEstimation);
        }
        let model = fit_similarity_umeyama(&pairs)?;

        debug!(
            "Pairwise estimate: scale {:.4}, rotation {:.4} rad, translation ({:.2}, {:.2}); \
             {} inlier / {} outlier regions, {} point pairs",
            model.scale,
            model.rotation,
            model.translation.x,
            model.translation.y,
            inlier_regions.len(),
            outlier_regions.len(),
            pairs.len()
        );

        Ok(FrameMatch {
            model,
            matched_frame_offset: frame_distance,
            inlier_regions,
            outlier_regions,
            inlier_scores,
            point_pair_count: pairs.len(),
            regions,
        })
    }

    /// Adaptive RANSAC over region triples. `on_best` observes every
    /// improvement of the tracked best score, in order.
    fn search(
        &self,
        regions: &[RegionCorrespondence],
        usable: &[usize],
        total_features: usize,
        threshold: f64,
        mut on_best: impl FnMut(usize),
    ) -> Result<Candidate, EstimateError> {
        let mut rng = SmallRng::seed_from_u64(self.params.seed);
        let mut best: Option<Candidate> = None;
        let mut iteration_cap = self.params.max_iterations;
        let mut degenerate_tries = 0usize;
        let mut iteration = 0usize;

        while iteration < iteration_cap {
            if degenerate_tries >= self.params.max_degenerate_tries {
                if best.is_none() {
                    debug!(
                        "RANSAC gave up after {} degenerate samples",
                        degenerate_tries
                    );
                    return Err(EstimateError::ModelEstimation);
                }
                break;
            }

            let picked: Vec<usize> = sample(&mut rng, usable.len(), self.params.sample_regions)
                .iter()
                .map(|k| usable[k])
                .collect();
            let pairs = pool_pairs(regions, &picked);

            let model = match fit_linear_similarity(&pairs) {
                Some(model) => model,
                None => {
                    trace!("RANSAC iteration {}: singular sample, retrying", iteration);
                    degenerate_tries += 1;
                    continue;
                }
            };

            let candidate = score_candidate(
                &model,
                regions,
                threshold,
                self.params.region_inlier_fraction,
            );
            iteration += 1;

            let improved = best
                .as_ref()
                .map(|b| candidate.score > b.score)
                .unwrap_or(true);
            if improved {
                debug!(
                    "RANSAC iteration {}: new best with score {}",
                    iteration, candidate.score
                );
                on_best(candidate.score);
                best = Some(candidate);
            }

            // Shrink the remaining budget from the current best inlier ratio.
            if let Some(b) = &best {
                let w = b.score as f64 / total_features as f64;
                if w >= 1.0 {
                    iteration_cap = iteration_cap.min(self.params.min_iterations.max(iteration));
                } else if w > 0.0 {
                    let p_sample = w.powi(self.params.sample_regions as i32);
                    if p_sample > f64::EPSILON {
                        let needed = ((1.0 - self.params.confidence).ln()
                            / (1.0 - p_sample).ln())
                        .ceil() as usize;
                        // The floor wins when the configured bounds are
                        // inverted, so the clamp stays well formed.
                        let upper = self.params.max_iterations.max(self.params.min_iterations);
                        iteration_cap = needed.clamp(self.params.min_iterations, upper);
                    }
                }
            }
        }

        best.ok_or(EstimateError::ModelEstimation)
    }

    /// Inlier distance threshold, scaled by inter-frame distance and a
    /// robust (median) motion magnitude.
    fn inlier_distance_threshold(
        &self,
        regions: &[RegionCorrespondence],
        usable: &[usize],
        norm_scale: f64,
        frame_distance: usize,
    ) -> f64 {
        let mut magnitudes: Vec<f64> = usable
            .iter()
            .flat_map(|&i| regions[i].features.iter().map(|f| f.displacement.norm()))
            .collect();
        magnitudes.sort_by(|a, b| a.total_cmp(b));
        let median = magnitudes[magnitudes.len() / 2];
        let error_scale = norm_scale * frame_distance.max(1) as f64 * (1.0 + median);
        self.params.inlier_threshold * error_scale
    }
}

/// Distance between where `model` sends the feature and where the tracker
/// observed it in the matched frame.
fn residual(model: &Similarity2, feature: &FeatureCorrespondence) -> f64 {
    (model.transform_point(&feature.location) - feature.matched_location()).norm()
}

fn pool_pairs(
    regions: &[RegionCorrespondence],
    indices: &[usize],
) -> Vec<(Point2<f64>, Point2<f64>, f64)> {
    indices
        .iter()
        .flat_map(|&i| {
            regions[i]
                .features
                .iter()
                .map(|f| (f.location, f.matched_location(), f.weight))
        })
        .collect()
}

fn score_candidate(
    model: &Similarity2,
    regions: &[RegionCorrespondence],
    threshold: f64,
    region_inlier_fraction: f64,
) -> Candidate {
    let mut score = 0usize;
    let mut region_inlier = vec![false; regions.len()];
    let mut mean_residuals = vec![0.0; regions.len()];

    for (idx, region) in regions.iter().enumerate() {
        if region.features.is_empty() {
            continue;
        }
        let mut conforming = 0usize;
        let mut residual_sum = 0.0;
        for f in &region.features {
            let r = residual(model, f);
            residual_sum += r;
            if r < threshold {
                conforming += 1;
            }
        }
        mean_residuals[idx] = residual_sum / region.features.len() as f64;
        let fraction = conforming as f64 / region.features.len() as f64;
        if fraction >= region_inlier_fraction {
            region_inlier[idx] = true;
            score += conforming;
        }
    }

    Candidate {
        model: *model,
        score,
        region_inlier,
        mean_residuals,
    }
}

/// Linear least-squares fit of the similarity constraint
/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`. Returns `None` when the
/// system is singular or the recovered scale is degenerate.
fn fit_linear_similarity(pairs: &[(Point2<f64>, Point2<f64>, f64)]) -> Option<Similarity2> {
    if pairs.len() < 2 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * pairs.len(), 4);
    let mut b = DVector::<f64>::zeros(2 * pairs.len());
    for (row, (src, dst, weight)) in pairs.iter().enumerate() {
        let w = weight.sqrt();
        a[(2 * row, 0)] = w * src.x;
        a[(2 * row, 1)] = -w * src.y;
        a[(2 * row, 2)] = w;
        a[(2 * row + 1, 0)] = w * src.y;
        a[(2 * row + 1, 1)] = w * src.x;
        a[(2 * row + 1, 3)] = w;
        b[2 * row] = w * dst.x;
        b[2 * row + 1] = w * dst.y;
    }

    let svd = nalgebra::SVD::new(a, true, true);
    let smallest = svd.singular_values.min();
    if smallest < 1e-9 {
        return None;
    }
    let solution = svd.solve(&b, 1e-12).ok()?;

    let scale = solution[0].hypot(solution[1]);
    if !scale.is_finite() || scale < 1e-9 {
        return None;
    }
    Some(Similarity2::new(
        scale,
        solution[1].atan2(solution[0]),
        Vector2::new(solution[2], solution[3]),
    ))
}

/// Closed-form weighted similarity fit (Umeyama): centroid subtraction,
/// 2x2 cross-covariance SVD with reflection correction, scale from the
/// singular values over the source variance.
fn fit_similarity_umeyama(
    pairs: &[(Point2<f64>, Point2<f64>, f64)],
) -> Result<Similarity2, EstimateError> {
    let weight_sum: f64 = pairs.iter().map(|(_, _, w)| w).sum();
    if weight_sum <= 0.0 {
        return Err(EstimateError::ModelEstimation);
    }

    let src_centroid = pairs
        .iter()
        .fold(Vector2::zeros(), |acc, (s, _, w)| acc + *w * s.coords)
        / weight_sum;
    let dst_centroid = pairs
        .iter()
        .fold(Vector2::zeros(), |acc, (_, d, w)| acc + *w * d.coords)
        / weight_sum;

    let mut covariance = Matrix2::<f64>::zeros();
    let mut src_variance = 0.0;
    for (src, dst, w) in pairs {
        let s = src.coords - src_centroid;
        let d = dst.coords - dst_centroid;
        covariance += *w * d * s.transpose();
        src_variance += *w * s.norm_squared();
    }
    covariance /= weight_sum;
    src_variance /= weight_sum;

    if src_variance < 1e-12 {
        // All sources coincide; the best similarity is a pure translation.
        return Ok(Similarity2::new(1.0, 0.0, dst_centroid - src_centroid));
    }

    let svd =
        nalgebra::SVD::try_new(covariance, true, true, 1e-12, 250).ok_or(EstimateError::Solver)?;
    let u = svd.u.ok_or(EstimateError::Solver)?;
    let v_t = svd.v_t.ok_or(EstimateError::Solver)?;

    // Reflection correction from the covariance determinant sign.
    let d = if u.determinant() * v_t.determinant() < 0.0 {
        -1.0
    } else {
        1.0
    };
    let rotation_matrix = u * Matrix2::new(1.0, 0.0, 0.0, d) * v_t;
    let rotation = rotation_matrix[(1, 0)].atan2(rotation_matrix[(0, 0)]);
    let scale = (svd.singular_values[0] + d * svd.singular_values[1]) / src_variance;
    let translation = dst_centroid - scale * crate::math::rotate(rotation, &src_centroid);

    Ok(Similarity2::new(scale, rotation, translation))
}
