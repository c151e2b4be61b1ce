//! Search state machine
//!
//! INIT evaluates a starting point, then rounds of PROPOSING and EVALUATING
//! run until the strategy converges, runs out of candidates, or time runs
//! out. Only this control loop mutates `CalibrationState`; candidates of a
//! round are evaluated concurrently and joined before acceptance.

use futures::future::join_all;
use platform_params::{ParamError, ParameterAssignment};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::strategy::{strategy_for, Evaluated, SearchStrategy};
use crate::trial::{ScenarioFailure, TrialOutcome, TrialRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Init,
    Proposing,
    Evaluating,
    Accepted,
    Rejected,
    Converged,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationState {
    pub phase: Phase,
    pub best: Option<ParameterAssignment>,
    pub best_loss: f64,
    pub epsilon: Option<f64>,
    pub rounds: usize,
    pub evaluations: usize,
    pub stale_rounds: usize,
    /// Consecutive rounds in which no candidate produced a loss
    pub invalid_rounds: usize,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            phase: Phase::Init,
            best: None,
            best_loss: f64::INFINITY,
            epsilon: None,
            rounds: 0,
            evaluations: 0,
            stale_rounds: 0,
            invalid_rounds: 0,
        }
    }
}

impl CalibrationState {
    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, round = self.rounds, "phase");
        self.phase = phase;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    TimedOut,
    /// The strategy had no candidates left
    Exhausted,
    MaxRounds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: usize,
    pub candidates: usize,
    pub succeeded: usize,
    pub rejected: usize,
    pub invalid: usize,
    pub best_loss: f64,
    pub improved: bool,
    pub epsilon: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub best: ParameterAssignment,
    pub loss: f64,
    pub termination: Termination,
    pub rounds: usize,
    pub evaluations: usize,
    pub elapsed_secs: f64,
    pub history: Vec<RoundRecord>,
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("invalid starting point: {0}")]
    Start(#[from] ParamError),
    #[error("no valid starting point after {attempts} attempts")]
    NoValidStart {
        attempts: usize,
        failures: Vec<ScenarioFailure>,
    },
    #[error("every candidate was invalid for {rounds} consecutive rounds (best loss so far {best_loss})")]
    AllCandidatesInvalid {
        best: Option<ParameterAssignment>,
        best_loss: f64,
        rounds: usize,
        failures: Vec<ScenarioFailure>,
    },
    #[error("time limit reached before any valid evaluation ({evaluations} attempted)")]
    TimedOut { evaluations: usize },
}

pub struct Calibrator {
    runner: TrialRunner,
    strategy: Box<dyn SearchStrategy>,
    config: SearchConfig,
    time_limit: Option<Duration>,
    rng: StdRng,
    state: CalibrationState,
    history: Vec<RoundRecord>,
}

impl Calibrator {
    pub fn new(runner: TrialRunner, config: SearchConfig) -> Self {
        Self {
            strategy: strategy_for(&config),
            rng: StdRng::seed_from_u64(config.seed),
            runner,
            config,
            time_limit: None,
            state: CalibrationState::default(),
            history: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Budget checked between rounds; a hard deadline lives in the coordinator
    pub fn with_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn runner(&self) -> &TrialRunner {
        &self.runner
    }

    fn out_of_time(&self, started: Instant) -> bool {
        self.time_limit.is_some_and(|limit| started.elapsed() >= limit) || self.runner.coordinator().is_expired()
    }

    pub async fn run(mut self) -> Result<CalibrationResult, CalibrationError> {
        let started = Instant::now();
        info!(
            strategy = self.strategy.name(),
            dims = self.runner.space().dims(),
            units_per_trial = self.runner.units_per_trial(),
            deadline = ?self.config.deadline,
            "calibration started"
        );

        self.initialize(started).await?;
        let termination = self.search(started).await?;

        let best = match self.state.best {
            Some(best) => best,
            None => {
                return Err(CalibrationError::TimedOut {
                    evaluations: self.state.evaluations,
                })
            }
        };
        info!(
            loss = self.state.best_loss,
            rounds = self.state.rounds,
            evaluations = self.state.evaluations,
            ?termination,
            "calibration finished"
        );
        Ok(CalibrationResult {
            best,
            loss: self.state.best_loss,
            termination,
            rounds: self.state.rounds,
            evaluations: self.state.evaluations,
            elapsed_secs: started.elapsed().as_secs_f64(),
            history: self.history,
        })
    }

    async fn initialize(&mut self, started: Instant) -> Result<(), CalibrationError> {
        self.state.enter(Phase::Init);
        let space = self.runner.space().clone();
        let mut next = match &self.config.start {
            Some(start) => space.conform(start)?,
            None => space.sample(&mut self.rng),
        };

        let attempts = self.config.max_invalid_rounds + 1;
        let mut tried = Vec::new();
        let mut failures = Vec::new();
        for attempt in 1..=attempts {
            let outcome = self.runner.evaluate(&next, None).await;
            self.state.evaluations += 1;
            let evaluated = Evaluated {
                assignment: next,
                outcome,
            };
            match &evaluated.outcome {
                TrialOutcome::Success { loss, .. } => {
                    info!(loss, "starting point evaluated");
                    self.state.best = Some(evaluated.assignment);
                    self.state.best_loss = *loss;
                    tried.push(evaluated);
                    self.strategy.seed(&tried, &space);
                    return Ok(());
                }
                TrialOutcome::Invalid(invalid) if invalid.is_cancelled() || self.out_of_time(started) => {
                    self.state.enter(Phase::TimedOut);
                    return Err(CalibrationError::TimedOut {
                        evaluations: self.state.evaluations,
                    });
                }
                TrialOutcome::Invalid(invalid) => {
                    warn!(attempt, attempts, "starting point invalid, sampling another");
                    failures = invalid.failures.clone();
                }
                TrialOutcome::Rejected { .. } => {}
            }
            tried.push(evaluated);
            next = space.sample(&mut self.rng);
        }
        Err(CalibrationError::NoValidStart { attempts, failures })
    }

    async fn search(&mut self, started: Instant) -> Result<Termination, CalibrationError> {
        let space = self.runner.space().clone();
        loop {
            if self.strategy.converged() {
                self.state.enter(Phase::Converged);
                return Ok(Termination::Converged);
            }
            if self.config.max_rounds.is_some_and(|max| self.state.rounds >= max) {
                return Ok(Termination::MaxRounds);
            }
            if self.out_of_time(started) {
                self.state.enter(Phase::TimedOut);
                return Ok(Termination::TimedOut);
            }

            self.state.enter(Phase::Proposing);
            let candidates = self.strategy.propose(&self.state, &space, &mut self.rng);
            if candidates.is_empty() {
                if self.strategy.converged() {
                    self.state.enter(Phase::Converged);
                    return Ok(Termination::Converged);
                }
                return Ok(Termination::Exhausted);
            }

            self.state.enter(Phase::Evaluating);
            let threshold = self.config.reject_threshold(self.state.best_loss);
            let runner = &self.runner;
            let outcomes = join_all(candidates.iter().map(|c| runner.evaluate(c, threshold))).await;
            let evaluated: Vec<Evaluated> = candidates
                .into_iter()
                .zip(outcomes)
                .map(|(assignment, outcome)| Evaluated { assignment, outcome })
                .collect();
            self.state.rounds += 1;
            self.state.evaluations += evaluated.len();

            let improved = self.accept(&evaluated);
            self.strategy.observe(&evaluated, &space, improved);
            self.state.epsilon = self.strategy.step_size();
            self.record(&evaluated, improved);

            let invalid: Vec<_> = evaluated.iter().filter_map(|e| e.outcome.invalid()).collect();
            let cancelled = invalid.iter().any(|i| i.is_cancelled());
            if cancelled && self.out_of_time(started) {
                // hard deadline cut this round short; completed trials were still used
                self.state.enter(Phase::TimedOut);
                return Ok(Termination::TimedOut);
            }
            if invalid.len() == evaluated.len() && !cancelled {
                self.state.invalid_rounds += 1;
                warn!(
                    round = self.state.rounds,
                    consecutive = self.state.invalid_rounds,
                    "every candidate in the round was invalid"
                );
                if self.state.invalid_rounds > self.config.max_invalid_rounds {
                    return Err(CalibrationError::AllCandidatesInvalid {
                        best: self.state.best,
                        best_loss: self.state.best_loss,
                        rounds: self.state.invalid_rounds,
                        failures: invalid.iter().flat_map(|i| i.failures.iter().cloned()).collect(),
                    });
                }
            } else {
                self.state.invalid_rounds = 0;
            }
        }
    }

    /// Adopt the round's best successful candidate if it beats the current best
    fn accept(&mut self, evaluated: &[Evaluated]) -> bool {
        let winner = evaluated
            .iter()
            .filter_map(|e| match e.outcome {
                TrialOutcome::Success { loss, .. } if loss.is_finite() => Some((loss, e.assignment)),
                _ => None,
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match winner {
            Some((loss, assignment)) if loss < self.state.best_loss => {
                self.state.enter(Phase::Accepted);
                info!(round = self.state.rounds, loss, previous = self.state.best_loss, "new best");
                self.state.best = Some(assignment);
                self.state.best_loss = loss;
                self.state.stale_rounds = 0;
                true
            }
            _ => {
                self.state.enter(Phase::Rejected);
                self.state.stale_rounds += 1;
                false
            }
        }
    }

    fn record(&mut self, evaluated: &[Evaluated], improved: bool) {
        let count = |f: fn(&TrialOutcome) -> bool| evaluated.iter().filter(|e| f(&e.outcome)).count();
        let entry = RoundRecord {
            round: self.state.rounds,
            candidates: evaluated.len(),
            succeeded: count(|o| matches!(o, TrialOutcome::Success { .. })),
            rejected: count(|o| matches!(o, TrialOutcome::Rejected { .. })),
            invalid: count(|o| matches!(o, TrialOutcome::Invalid(_))),
            best_loss: self.state.best_loss,
            improved,
            epsilon: self.state.epsilon,
        };
        info!(
            round = entry.round,
            candidates = entry.candidates,
            succeeded = entry.succeeded,
            rejected = entry.rejected,
            invalid = entry.invalid,
            best_loss = entry.best_loss,
            epsilon = ?entry.epsilon,
            "round finished"
        );
        self.history.push(entry);
    }
}
