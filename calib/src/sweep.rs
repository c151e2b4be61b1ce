//! Step-size sweep for coordinate descent
//!
//! Runs one gradient calibration per decade of initial step size, all from
//! the same starting point, and reports the loss each one reached.

use platform_params::ParameterAssignment;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::calibrator::{Calibrator, Termination};
use crate::config::{Algorithm, CalibrationConfig};
use crate::trial::TrialRunner;

#[derive(Debug, Error, PartialEq)]
pub enum SweepError {
    #[error("sweep bounds must satisfy 0 < low <= high, got {low}..{high}")]
    Bounds { low: f64, high: f64 },
}

/// Powers of ten from the decade of `low` through the decade of `high`
pub fn decades(low: f64, high: f64) -> Result<Vec<f64>, SweepError> {
    if !(low.is_finite() && high.is_finite() && low > 0.0 && low <= high) {
        return Err(SweepError::Bounds { low, high });
    }
    let exponent = |x: f64| {
        let e = x.log10();
        // 1e-3 is a hair above -3 in floating point
        if (e - e.round()).abs() < 1e-9 {
            e.round() as i32
        } else {
            e.trunc() as i32
        }
    };
    Ok((exponent(low)..=exponent(high)).map(|j| 10f64.powi(j)).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpsilonRun {
    pub epsilon: f64,
    pub loss: f64,
    pub termination: Option<Termination>,
    pub best: Option<ParameterAssignment>,
    pub rounds: usize,
    pub evaluations: usize,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub start: ParameterAssignment,
    pub runs: Vec<EpsilonRun>,
    pub best_epsilon: Option<f64>,
    pub best_loss: f64,
}

/// Calibrate once per step size with the gradient strategy
///
/// Every run gets a fresh coordinator, so the configured time limit applies
/// to each run on its own.
pub async fn sweep_epsilon(runner: &TrialRunner, config: &CalibrationConfig, epsilons: &[f64]) -> SweepResult {
    let start = match config.search.start {
        Some(start) => start,
        None => runner.space().sample(&mut StdRng::seed_from_u64(config.search.seed)),
    };

    let mut runs = Vec::with_capacity(epsilons.len());
    for &epsilon in epsilons {
        let mut search = config.search.clone();
        search.algorithm = Algorithm::Gradient;
        search.gradient.epsilon = epsilon;
        search.start = Some(start);

        let started = Instant::now();
        let calibrator = Calibrator::new(runner.fork(Arc::new(config.coordinator())), search)
            .with_time_limit(config.coordinator.time_limit());
        let run = match calibrator.run().await {
            Ok(result) => EpsilonRun {
                epsilon,
                loss: result.loss,
                termination: Some(result.termination),
                best: Some(result.best),
                rounds: result.rounds,
                evaluations: result.evaluations,
                elapsed_secs: result.elapsed_secs,
                error: None,
            },
            Err(e) => {
                warn!(epsilon, error = %e, "sweep run failed");
                EpsilonRun {
                    epsilon,
                    loss: f64::INFINITY,
                    termination: None,
                    best: None,
                    rounds: 0,
                    evaluations: 0,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    error: Some(e.to_string()),
                }
            }
        };
        info!(epsilon, loss = run.loss, rounds = run.rounds, "sweep run finished");
        runs.push(run);
    }

    let best = runs
        .iter()
        .filter(|r| r.loss.is_finite())
        .min_by(|a, b| a.loss.total_cmp(&b.loss));
    SweepResult {
        start,
        best_epsilon: best.map(|r| r.epsilon),
        best_loss: best.map_or(f64::INFINITY, |r| r.loss),
        runs,
    }
}
