//! Gaussian-process guided search
//!
//! Losses are modelled as `ln(1 + loss)` over unit-cube coordinates with an
//! RBF kernel. Each round proposes the candidates with the highest expected
//! improvement over the best observation.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use platform_params::{ParameterAssignment, ParameterSpace};
use rand::rngs::StdRng;
use rand::Rng;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use tracing::{debug, warn};

use super::{Evaluated, SearchStrategy};
use crate::calibrator::CalibrationState;
use crate::config::SurrogateConfig;
use crate::trial::TrialOutcome;

const JITTER_ATTEMPTS: usize = 5;

pub struct SurrogateSearch {
    config: SurrogateConfig,
    xs: Vec<Vec<f64>>,
    ys: Vec<f64>,
}

impl SurrogateSearch {
    pub fn new(config: SurrogateConfig) -> Self {
        Self {
            config,
            xs: Vec::new(),
            ys: Vec::new(),
        }
    }

    /// Observations usable by the model
    pub fn observations(&self) -> usize {
        self.ys.len()
    }

    fn record(&mut self, evaluated: &[Evaluated], space: &ParameterSpace) {
        for e in evaluated {
            // a rejected trial still tells us the point is poor
            let loss = match &e.outcome {
                TrialOutcome::Success { loss, .. } => *loss,
                TrialOutcome::Rejected { partial_loss, .. } => *partial_loss,
                TrialOutcome::Invalid(_) => continue,
            };
            if !loss.is_finite() {
                continue;
            }
            self.xs.push(space.to_unit(&e.assignment));
            self.ys.push(loss.ln_1p());
        }
    }

    fn budget(&self, state: &CalibrationState) -> usize {
        match self.config.max_evaluations {
            Some(max) => max.saturating_sub(state.evaluations),
            None => usize::MAX,
        }
    }
}

impl SearchStrategy for SurrogateSearch {
    fn name(&self) -> &'static str {
        "surrogate"
    }

    fn propose(&mut self, state: &CalibrationState, space: &ParameterSpace, rng: &mut StdRng) -> Vec<ParameterAssignment> {
        let budget = self.budget(state);
        if budget == 0 {
            return Vec::new();
        }

        if self.ys.len() < self.config.initial_points {
            let n = (self.config.initial_points - self.ys.len()).min(budget);
            return (0..n).map(|_| space.sample(rng)).collect();
        }

        let model = match GaussianProcess::fit(&self.xs, &self.ys, self.config.length_scale, self.config.noise) {
            Some(model) => model,
            None => {
                warn!(observations = self.ys.len(), "surrogate fit failed, sampling at random");
                return (0..self.config.batch.min(budget)).map(|_| space.sample(rng)).collect();
            }
        };

        let dims = space.dims();
        let mut pool: Vec<Vec<f64>> = (0..self.config.candidates)
            .map(|_| (0..dims).map(|_| rng.gen::<f64>()).collect())
            .collect();
        if let Some(best) = &state.best {
            let centre = space.to_unit(best);
            for _ in 0..(self.config.candidates / 10).max(1) {
                pool.push(
                    centre
                        .iter()
                        .map(|c| (c + rng.gen_range(-0.05..0.05)).clamp(0.0, 1.0))
                        .collect(),
                );
            }
        }

        let best_y = model.best_standardized();
        let mut scored: Vec<(f64, Vec<f64>)> = pool
            .into_iter()
            .map(|x| (model.expected_improvement(&x, best_y, self.config.xi), x))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let n = self.config.batch.min(budget);
        let mut picked: Vec<Vec<f64>> = Vec::with_capacity(n);
        for (ei, x) in scored {
            if picked.len() == n {
                break;
            }
            if picked.iter().any(|p| squared_distance(p, &x) < 1e-12) {
                continue;
            }
            debug!(ei, "surrogate candidate");
            picked.push(x);
        }
        picked.iter().filter_map(|x| space.from_unit(x).ok()).collect()
    }

    fn seed(&mut self, evaluated: &[Evaluated], space: &ParameterSpace) {
        self.record(evaluated, space);
    }

    fn observe(&mut self, evaluated: &[Evaluated], space: &ParameterSpace, _improved: bool) {
        self.record(evaluated, space);
    }

    fn converged(&self) -> bool {
        false
    }
}

struct GaussianProcess {
    xs: Vec<Vec<f64>>,
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    standardized: DVector<f64>,
    length_scale: f64,
    unit: Normal,
}

impl GaussianProcess {
    fn fit(xs: &[Vec<f64>], ys: &[f64], length_scale: f64, noise: f64) -> Option<Self> {
        let n = ys.len();
        if n == 0 {
            return None;
        }
        let mean = ys.iter().sum::<f64>() / n as f64;
        let var = ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64;
        let std = if var > 1e-24 { var.sqrt() } else { 1.0 };
        let standardized = DVector::from_iterator(n, ys.iter().map(|y| (y - mean) / std));

        let kernel = DMatrix::from_fn(n, n, |i, j| rbf(&xs[i], &xs[j], length_scale));

        // escalate the diagonal until the factorisation succeeds
        let mut jitter = noise.max(1e-10);
        let mut chol = None;
        for _ in 0..JITTER_ATTEMPTS {
            let k = &kernel + DMatrix::<f64>::identity(n, n) * jitter;
            if let Some(c) = k.cholesky() {
                chol = Some(c);
                break;
            }
            jitter *= 100.0;
        }
        let chol = chol?;
        let alpha = chol.solve(&standardized);

        Some(Self {
            xs: xs.to_vec(),
            chol,
            alpha,
            standardized,
            length_scale,
            unit: Normal::new(0.0, 1.0).ok()?,
        })
    }

    fn best_standardized(&self) -> f64 {
        self.standardized.min()
    }

    fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k = DVector::from_iterator(self.xs.len(), self.xs.iter().map(|xi| rbf(xi, x, self.length_scale)));
        let mean = k.dot(&self.alpha);
        let explained = match self.chol.l_dirty().solve_lower_triangular(&k) {
            Some(v) => v.norm_squared(),
            None => 0.0,
        };
        let var = (1.0 - explained).max(1e-12);
        (mean, var.sqrt())
    }

    /// Expected improvement for minimisation
    fn expected_improvement(&self, x: &[f64], best: f64, xi: f64) -> f64 {
        let (mean, sigma) = self.predict(x);
        let improvement = best - mean - xi;
        let z = improvement / sigma;
        improvement * self.unit.cdf(z) + sigma * self.unit.pdf(z)
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    (-squared_distance(a, b) / (2.0 * length_scale * length_scale)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::{InvalidReason, InvalidTrial};
    use rand::SeedableRng;
    use trace_loss::LossReport;

    #[test]
    fn test_fit_survives_duplicate_points() {
        // identical inputs make the bare kernel singular; jitter must rescue it
        let xs = vec![vec![0.3, 0.3], vec![0.3, 0.3], vec![0.7, 0.1]];
        let ys = vec![1.0, 1.0, 0.5];
        let gp = GaussianProcess::fit(&xs, &ys, 0.3, 0.0).unwrap();
        let (mean, sigma) = gp.predict(&[0.3, 0.3]);
        assert!(mean.is_finite());
        assert!(sigma.is_finite() && sigma > 0.0);
    }

    #[test]
    fn test_expected_improvement_tail() {
        let xs = vec![vec![0.1], vec![0.5], vec![0.9]];
        let ys = vec![1.0, 0.0, 1.0];
        let gp = GaussianProcess::fit(&xs, &ys, 0.2, 1e-8).unwrap();
        assert!((gp.unit.cdf(-6.0) - 9.865_876_450_377e-10).abs() < 1e-15);
        assert!((gp.unit.cdf(1.96) - 0.975_002_104_851_78).abs() < 1e-12);

        // no improvement is expected where an observation sits above the best
        let best = gp.best_standardized();
        let at_peak = gp.expected_improvement(&[0.1], best, 0.0);
        let near_min = gp.expected_improvement(&[0.45], best, 0.0);
        assert!(at_peak >= 0.0 && at_peak < 1e-6);
        assert!(near_min > at_peak);
    }

    #[test]
    fn test_gp_interpolates() {
        let xs = vec![vec![0.1], vec![0.5], vec![0.9]];
        let ys = vec![1.0, 0.0, 1.0];
        let gp = GaussianProcess::fit(&xs, &ys, 0.2, 1e-8).unwrap();
        let (at_min, sigma) = gp.predict(&[0.5]);
        assert!((at_min - gp.best_standardized()).abs() < 1e-3);
        assert!(sigma < 1e-2);
        // far from data the model is uncertain
        let (_, far) = gp.predict(&[0.0]);
        assert!(far > sigma);
    }

    fn evaluated(space: &ParameterSpace, coords: &[f64], loss: f64) -> Evaluated {
        Evaluated {
            assignment: space.from_unit(coords).unwrap(),
            outcome: TrialOutcome::Success {
                loss,
                report: LossReport::default(),
            },
        }
    }

    #[test]
    fn test_initial_points_then_model() {
        let space = ParameterSpace::default();
        let mut rng = StdRng::seed_from_u64(9);
        let config = SurrogateConfig {
            initial_points: 4,
            batch: 3,
            candidates: 200,
            ..SurrogateConfig::default()
        };
        let mut search = SurrogateSearch::new(config);
        let state = CalibrationState::default();
        let first = search.propose(&state, &space, &mut rng);
        assert_eq!(first.len(), 4);

        let results: Vec<Evaluated> = first
            .iter()
            .enumerate()
            .map(|(i, a)| Evaluated {
                assignment: *a,
                outcome: TrialOutcome::Success {
                    loss: i as f64,
                    report: LossReport::default(),
                },
            })
            .collect();
        search.observe(&results, &space, true);
        let state = CalibrationState {
            best: Some(first[0]),
            best_loss: 0.0,
            evaluations: 4,
            ..CalibrationState::default()
        };
        assert_eq!(search.propose(&state, &space, &mut rng).len(), 3);
    }

    #[test]
    fn test_invalid_points_not_modelled() {
        let space = ParameterSpace::default();
        let coords = vec![0.5; space.dims()];
        let mut search = SurrogateSearch::new(SurrogateConfig::default());
        let invalid = Evaluated {
            assignment: space.from_unit(&coords).unwrap(),
            outcome: TrialOutcome::Invalid(InvalidTrial {
                reason: InvalidReason::DegenerateLoss,
                failures: Vec::new(),
            }),
        };
        search.seed(&[invalid, evaluated(&space, &coords, 2.0)], &space);
        assert_eq!(search.observations(), 1);
    }

    #[test]
    fn test_budget_exhausted() {
        let space = ParameterSpace::default();
        let mut search = SurrogateSearch::new(SurrogateConfig {
            max_evaluations: Some(3),
            ..SurrogateConfig::default()
        });
        let state = CalibrationState {
            evaluations: 3,
            ..CalibrationState::default()
        };
        assert!(search.propose(&state, &space, &mut StdRng::seed_from_u64(0)).is_empty());
    }
}
