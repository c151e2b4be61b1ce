//! Proposal rules for the calibrator
//!
//! Every strategy only decides which assignments to try next. Evaluation,
//! acceptance and termination bookkeeping stay in the calibrator.

mod surrogate;

pub use surrogate::SurrogateSearch;

use platform_params::{ParameterAssignment, ParameterSpace};
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::calibrator::CalibrationState;
use crate::config::{Algorithm, GradientConfig, GridConfig, RandomConfig, SearchConfig};
use crate::trial::TrialOutcome;

/// One candidate together with how its trial went
#[derive(Debug, Clone)]
pub struct Evaluated {
    pub assignment: ParameterAssignment,
    pub outcome: TrialOutcome,
}

pub trait SearchStrategy: Send {
    fn name(&self) -> &'static str;

    /// Next batch of candidates; empty when the strategy has nothing left
    fn propose(&mut self, state: &CalibrationState, space: &ParameterSpace, rng: &mut StdRng) -> Vec<ParameterAssignment>;

    /// Starting point(s) evaluated before the first round
    fn seed(&mut self, _evaluated: &[Evaluated], _space: &ParameterSpace) {}

    /// Results of the round just proposed
    fn observe(&mut self, _evaluated: &[Evaluated], _space: &ParameterSpace, _improved: bool) {}

    fn converged(&self) -> bool {
        false
    }

    /// Current step size, for strategies that have one
    fn step_size(&self) -> Option<f64> {
        None
    }
}

pub fn strategy_for(config: &SearchConfig) -> Box<dyn SearchStrategy> {
    match config.algorithm {
        Algorithm::Gradient => Box::new(CoordinateDescent::new(config.gradient.clone())),
        Algorithm::Random => Box::new(RandomSearch::new(config.random.clone())),
        Algorithm::Grid => Box::new(GridSearch::new(config.grid.clone())),
        Algorithm::Surrogate => Box::new(SurrogateSearch::new(config.surrogate.clone())),
    }
}

/// Multiplicative coordinate descent around the current best
pub struct CoordinateDescent {
    config: GradientConfig,
    epsilon: f64,
    stale: usize,
}

impl CoordinateDescent {
    pub fn new(config: GradientConfig) -> Self {
        Self {
            epsilon: config.epsilon,
            config,
            stale: 0,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl SearchStrategy for CoordinateDescent {
    fn name(&self) -> &'static str {
        "gradient"
    }

    fn propose(&mut self, state: &CalibrationState, space: &ParameterSpace, rng: &mut StdRng) -> Vec<ParameterAssignment> {
        let best = match &state.best {
            Some(best) => *best,
            None => return vec![space.sample(rng)],
        };
        let factor = 1.0 + self.epsilon;
        let mut candidates = Vec::with_capacity(space.dims() * 2);
        for spec in space.free() {
            let value = best.get(spec.param);
            let mut steps = vec![value * factor];
            if self.config.both_directions {
                steps.push(value / factor);
            }
            for step in steps {
                let candidate = space.with_value(&best, spec.param, step);
                // clamped onto the bound it already sits on
                if candidate != best && !candidates.contains(&candidate) {
                    candidates.push(candidate);
                }
            }
        }
        candidates
    }

    fn observe(&mut self, _evaluated: &[Evaluated], _space: &ParameterSpace, improved: bool) {
        if improved {
            self.epsilon = (self.epsilon * self.config.grow).min(self.config.epsilon * 4.0);
            self.stale = 0;
        } else {
            self.epsilon *= self.config.decay;
            self.stale += 1;
        }
        debug!(epsilon = self.epsilon, stale = self.stale, "step size updated");
    }

    fn converged(&self) -> bool {
        self.epsilon < self.config.min_epsilon || self.config.patience.is_some_and(|p| self.stale >= p)
    }

    fn step_size(&self) -> Option<f64> {
        Some(self.epsilon)
    }
}

/// Independent draws from the prior
pub struct RandomSearch {
    config: RandomConfig,
}

impl RandomSearch {
    pub fn new(config: RandomConfig) -> Self {
        Self { config }
    }
}

impl SearchStrategy for RandomSearch {
    fn name(&self) -> &'static str {
        "random"
    }

    fn propose(&mut self, state: &CalibrationState, space: &ParameterSpace, rng: &mut StdRng) -> Vec<ParameterAssignment> {
        let n = match self.config.max_evaluations {
            Some(max) => self.config.batch.min(max.saturating_sub(state.evaluations)),
            None => self.config.batch,
        };
        (0..n).map(|_| space.sample(rng)).collect()
    }
}

/// Progressively refined grid over the unit cube
///
/// Level `L` holds the points `k / 2^L` in every dimension. Points already
/// on a coarser level are skipped, so each level adds only new midpoints.
pub struct GridSearch {
    config: GridConfig,
    level: u32,
    cursor: u64,
}

impl GridSearch {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            level: 1,
            cursor: 0,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    fn level_size(&self, dims: usize) -> u64 {
        let side = (1u64 << self.level) + 1;
        side.saturating_pow(dims as u32)
    }

    /// Unit coordinates of point `index` on the current level, if it is new there
    fn point(&self, index: u64, dims: usize) -> Option<Vec<f64>> {
        let steps = 1u64 << self.level;
        let side = steps + 1;
        let mut rest = index;
        let mut coords = Vec::with_capacity(dims);
        let mut coarse = true;
        for _ in 0..dims {
            let k = rest % side;
            rest /= side;
            coarse &= k % 2 == 0;
            coords.push(k as f64 / steps as f64);
        }
        if self.level > 1 && coarse {
            return None;
        }
        Some(coords)
    }
}

impl SearchStrategy for GridSearch {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn propose(&mut self, _state: &CalibrationState, space: &ParameterSpace, _rng: &mut StdRng) -> Vec<ParameterAssignment> {
        let dims = space.dims();
        let mut batch = Vec::with_capacity(self.config.batch);
        while batch.len() < self.config.batch && !self.converged() {
            if self.cursor >= self.level_size(dims) {
                self.level += 1;
                self.cursor = 0;
                debug!(level = self.level, "grid refined");
                continue;
            }
            let index = self.cursor;
            self.cursor += 1;
            if let Some(coords) = self.point(index, dims) {
                match space.from_unit(&coords) {
                    Ok(assignment) => batch.push(assignment),
                    Err(e) => warn!(error = %e, "grid point outside the space"),
                }
            }
        }
        batch
    }

    fn converged(&self) -> bool {
        self.level > self.config.max_level
    }
}
