//! Joint refinement of a closed window's per-frame transforms.
//!
//! Levenberg-Marquardt over 4 parameters per frame (scale, rotation,
//! translation), frame 0 pinned to identity for gauge freedom. Per-pair
//! costs use a truncated squared loss whose cap shrinks between rounds, so
//! marginal matches the pairwise estimator let through are rejected
//! progressively instead of dominating the solution.

pub mod graph;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use thiserror::Error;

use crate::math::similarity::Similarity2;
pub use graph::{CorrespondenceGraph, GraphEdge, PointPair};

#[derive(Debug, Error)]
pub enum SolveError {
    /// The damped normal-equations system could not be factorized.
    #[error("bundle adjustment normal equations are singular")]
    SingularSystem,
    /// The error kept increasing past the damping limit.
    #[error("bundle adjustment diverged after {iterations} iterations")]
    Diverged { iterations: usize },
    /// The graph and the initial models disagree on the window length.
    #[error("window has {frames} frames but {models} initial models")]
    DimensionMismatch { frames: usize, models: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    /// Levenberg-Marquardt iterations per robustification round.
    pub max_iterations: usize,
    /// Coarse-to-fine rounds; the error cap is quartered between rounds.
    pub rounds: usize,
    /// Initial cap on a pair's squared residual norm.
    pub error_cap: f64,
    /// Initial LM damping factor.
    pub damping: f64,
    /// Relative chi-squared change below which a round stops.
    pub convergence_threshold: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            rounds: 1,
            error_cap: 25.0,
            damping: 1e-3,
            convergence_threshold: 1e-9,
        }
    }
}

/// Refined transforms for a closed window, one per frame, each already
/// concatenated with the previous window's anchor. `models[0]` equals the
/// anchor itself (the key frame stays fixed).
#[derive(Debug, Clone)]
pub struct WindowSolution {
    pub models: Vec<Similarity2>,
    pub initial_chi2: f64,
    pub final_chi2: f64,
    pub iterations: usize,
}

pub struct BundleAdjuster {
    config: SolverConfig,
}

impl BundleAdjuster {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Jointly refines the window's transforms.
    ///
    /// `initial` holds one model per frame in the key-to-frame direction
    /// (model `i` maps key-frame coordinates into frame `i` coordinates,
    /// the direction the residual composes); `initial[0]` must be identity
    /// and is not optimized. `anchor` maps key-frame coordinates into the
    /// global origin; the returned models are frame-to-global.
    pub fn solve(
        &self,
        graph: &CorrespondenceGraph,
        initial: &[Similarity2],
        anchor: &Similarity2,
    ) -> Result<WindowSolution, SolveError> {
        if graph.num_frames() != initial.len() {
            return Err(SolveError::DimensionMismatch {
                frames: graph.num_frames(),
                models: initial.len(),
            });
        }
        let num_frames = initial.len();
        let dim = 4 * num_frames.saturating_sub(1);

        let mut params = DVector::<f64>::zeros(dim);
        for (i, model) in initial.iter().enumerate().skip(1) {
            let base = 4 * (i - 1);
            params[base] = model.scale;
            params[base + 1] = model.rotation;
            params[base + 2] = model.translation.x;
            params[base + 3] = model.translation.y;
        }

        let initial_chi2 = chi_squared(graph, &params, self.config.error_cap);
        let mut total_iterations = 0usize;

        let mut cap = self.config.error_cap;
        for round in 0..self.config.rounds.max(1) {
            debug!(
                "Bundle adjustment round {}: {} pairs, cap {:.3}",
                round,
                graph.total_pairs(),
                cap
            );
            total_iterations += self.run_round(graph, &mut params, cap)?;
            // Graduated robustification: reject more marginal matches next
            // round.
            cap *= 0.25;
        }

        let final_chi2 = chi_squared(graph, &params, self.config.error_cap);
        debug!(
            "Bundle adjustment finished: chi2 {:.4} -> {:.4} in {} iterations",
            initial_chi2, final_chi2, total_iterations
        );

        let mut models = Vec::with_capacity(num_frames);
        models.push(*anchor);
        for i in 1..num_frames {
            let base = 4 * (i - 1);
            let key_to_frame = Similarity2::new(
                params[base],
                params[base + 1],
                Vector2::new(params[base + 2], params[base + 3]),
            );
            models.push(anchor.concat(&key_to_frame.inverse()));
        }

        Ok(WindowSolution {
            models,
            initial_chi2,
            final_chi2,
            iterations: total_iterations,
        })
    }

    fn run_round(
        &self,
        graph: &CorrespondenceGraph,
        params: &mut DVector<f64>,
        cap: f64,
    ) -> Result<usize, SolveError> {
        let dim = params.len();
        if dim == 0 || graph.total_pairs() == 0 {
            return Ok(0);
        }

        let mut lambda = self.config.damping;
        let mut current_chi2 = chi_squared(graph, params, cap);
        let mut iterations = 0usize;

        for _ in 0..self.config.max_iterations {
            iterations += 1;
            let (hessian, gradient) = build_normal_equations(graph, params, cap);

            let step = loop {
                let mut damped = hessian.clone();
                for d in 0..dim {
                    damped[(d, d)] += lambda * damped[(d, d)].max(1e-6);
                }
                match damped.cholesky() {
                    Some(factorization) => break Some(factorization.solve(&(-&gradient))),
                    None => {
                        lambda *= 10.0;
                        if lambda > 1e10 {
                            break None;
                        }
                    }
                }
            };
            let step = step.ok_or(SolveError::SingularSystem)?;

            let candidate = params.clone() + &step;
            let scales_valid = (0..dim / 4).all(|k| candidate[4 * k] > 1e-9);
            let new_chi2 = if scales_valid {
                chi_squared(graph, &candidate, cap)
            } else {
                f64::INFINITY
            };

            if new_chi2 <= current_chi2 {
                let relative_change =
                    (current_chi2 - new_chi2) / current_chi2.max(f64::EPSILON);
                *params = candidate;
                current_chi2 = new_chi2;
                lambda = (lambda * 0.1).max(1e-12);
                if relative_change < self.config.convergence_threshold {
                    return Ok(iterations);
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e10 {
                    warn!(
                        "Bundle adjustment diverging: chi2 {:.4} -> {:.4}",
                        current_chi2, new_chi2
                    );
                    return Err(SolveError::Diverged { iterations });
                }
            }
        }

        Ok(iterations)
    }
}

fn frame_params(params: &DVector<f64>, index: usize) -> (f64, f64, Vector2<f64>) {
    if index == 0 {
        return (1.0, 0.0, Vector2::zeros());
    }
    let base = 4 * (index - 1);
    (
        params[base],
        params[base + 1],
        Vector2::new(params[base + 2], params[base + 3]),
    )
}

fn rotation_matrix(angle: f64) -> Matrix2<f64> {
    let (sin, cos) = angle.sin_cos();
    Matrix2::new(cos, -sin, sin, cos)
}

/// Derivative of the rotation matrix with respect to its angle.
fn rotation_derivative(angle: f64) -> Matrix2<f64> {
    let (sin, cos) = angle.sin_cos();
    Matrix2::new(-sin, -cos, cos, -sin)
}

/// Total truncated cost over every pair in the graph.
fn chi_squared(graph: &CorrespondenceGraph, params: &DVector<f64>, cap: f64) -> f64 {
    let mut chi2 = 0.0;
    for frame_index in 0..graph.num_frames() {
        let (s_i, phi_i, t_i) = frame_params(params, frame_index);
        for edge in graph.edges(frame_index) {
            let (s_j, phi_j, t_j) = frame_params(params, edge.matched_index);
            let k = s_i / s_j;
            let rot = rotation_matrix(phi_i - phi_j);
            for pair in &edge.pairs {
                let predicted = k * rot * (pair.matched.coords - t_j) + t_i;
                let residual = predicted - pair.current.coords;
                chi2 += pair.weight * residual.norm_squared().min(cap);
            }
        }
    }
    chi2
}

/// Accumulates `H = Σ w·JᵀJ` and `g = Σ w·Jᵀr` over every unsaturated pair.
/// Saturated pairs (squared residual beyond `cap`) sit on the flat part of
/// the truncated loss and contribute no gradient; frame-0 blocks are fixed.
fn build_normal_equations(
    graph: &CorrespondenceGraph,
    params: &DVector<f64>,
    cap: f64,
) -> (DMatrix<f64>, DVector<f64>) {
    let dim = params.len();
    let mut hessian = DMatrix::<f64>::zeros(dim, dim);
    let mut gradient = DVector::<f64>::zeros(dim);

    for frame_index in 0..graph.num_frames() {
        let (s_i, phi_i, t_i) = frame_params(params, frame_index);
        for edge in graph.edges(frame_index) {
            let j = edge.matched_index;
            let (s_j, phi_j, t_j) = frame_params(params, j);
            let k = s_i / s_j;
            let delta = phi_i - phi_j;
            let rot = rotation_matrix(delta);
            let rot_d = rotation_derivative(delta);

            for pair in &edge.pairs {
                let u = pair.matched.coords - t_j;
                let rot_u = rot * u;
                let predicted = k * rot_u + t_i;
                let residual = predicted - pair.current.coords;
                if residual.norm_squared() >= cap {
                    continue;
                }

                // Column layout per frame block: [scale, rotation, tx, ty].
                let mut blocks: Vec<(usize, [Vector2<f64>; 4])> = Vec::with_capacity(2);
                if frame_index > 0 {
                    blocks.push((
                        frame_index,
                        [
                            rot_u / s_j,
                            k * (rot_d * u),
                            Vector2::new(1.0, 0.0),
                            Vector2::new(0.0, 1.0),
                        ],
                    ));
                }
                if j > 0 {
                    blocks.push((
                        j,
                        [
                            -(k / s_j) * rot_u,
                            -k * (rot_d * u),
                            -k * Vector2::new(rot[(0, 0)], rot[(1, 0)]),
                            -k * Vector2::new(rot[(0, 1)], rot[(1, 1)]),
                        ],
                    ));
                }

                for &(frame_a, ref cols_a) in &blocks {
                    let base_a = 4 * (frame_a - 1);
                    for (col_a, deriv_a) in cols_a.iter().enumerate() {
                        gradient[base_a + col_a] += pair.weight * deriv_a.dot(&residual);
                        for &(frame_b, ref cols_b) in &blocks {
                            let base_b = 4 * (frame_b - 1);
                            for (col_b, deriv_b) in cols_b.iter().enumerate() {
                                hessian[(base_a + col_a, base_b + col_b)] +=
                                    pair.weight * deriv_a.dot(deriv_b);
                            }
                        }
                    }
                }
            }
        }
    }

    (hessian, gradient)
}
