//! Trials: one full evaluation of a parameter assignment
//!
//! Every (scenario, workload, hitrate) unit is a separate simulator run
//! submitted to the coordinator. Platform files and simulator outputs live
//! in a scratch directory owned by the trial and removed on every exit path.

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use job_traces::{Hitrate, ReferenceLayout, TraceAggregator, TraceSet};
use platform_params::{Param, ParameterAssignment, ParameterSpace, PlatformTemplate, PlatformValues, Scenario};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trace_loss::{LossEvaluator, LossReport};

use crate::config::WorkloadConfig;
use crate::coordinator::{Coordinator, WorkError};
use crate::invoker::{SimulationRequest, Simulator};

/// One simulator run that did not produce usable output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub scenario: Scenario,
    pub workload: String,
    pub hitrate: Hitrate,
    pub error: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} hitrate {}: {}", self.scenario, self.workload, self.hitrate, self.error)?;
        if let Some(stderr) = self.stderr.as_deref().filter(|s| !s.trim().is_empty()) {
            write!(f, "\n  stderr: {}", stderr.trim())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum InvalidReason {
    /// At least one simulator run failed
    SimulationFailed,
    /// No reference group could be compared
    DegenerateLoss,
    /// The trial was cut short by cancellation or the deadline
    Cancelled,
    Template(String),
    Scratch(String),
    LossEvaluation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidTrial {
    pub reason: InvalidReason,
    pub failures: Vec<ScenarioFailure>,
}

impl InvalidTrial {
    fn new(reason: InvalidReason) -> Self {
        Self {
            reason,
            failures: Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason == InvalidReason::Cancelled
    }
}

/// Result of evaluating one assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrialOutcome {
    Success { loss: f64, report: LossReport },
    /// Abandoned at a scenario boundary, partial loss already above threshold
    Rejected { partial_loss: f64, completed_scenarios: usize },
    Invalid(InvalidTrial),
}

impl TrialOutcome {
    /// Finite only for successful trials; rejections report their partial loss
    pub fn loss(&self) -> f64 {
        match self {
            TrialOutcome::Success { loss, .. } => *loss,
            TrialOutcome::Rejected { partial_loss, .. } => *partial_loss,
            TrialOutcome::Invalid(_) => f64::INFINITY,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TrialOutcome::Success { .. })
    }

    pub fn invalid(&self) -> Option<&InvalidTrial> {
        match self {
            TrialOutcome::Invalid(invalid) => Some(invalid),
            _ => None,
        }
    }
}

struct Unit {
    scenario: Scenario,
    workload: String,
    hitrate: Hitrate,
}

/// Runs trials against a fixed reference set
pub struct TrialRunner {
    simulator: Arc<dyn Simulator>,
    coordinator: Arc<Coordinator>,
    evaluator: LossEvaluator,
    space: Arc<ParameterSpace>,
    template: Arc<PlatformTemplate>,
    reference: Arc<TraceSet>,
    workloads: Vec<WorkloadConfig>,
    hitrates: Vec<Hitrate>,
    scenarios: Vec<Scenario>,
    scratch_root: Option<PathBuf>,
    next_trial: AtomicU64,
}

impl TrialRunner {
    pub fn new(
        simulator: Arc<dyn Simulator>,
        coordinator: Arc<Coordinator>,
        evaluator: LossEvaluator,
        space: Arc<ParameterSpace>,
        template: Arc<PlatformTemplate>,
        reference: Arc<TraceSet>,
    ) -> Self {
        Self {
            simulator,
            coordinator,
            evaluator,
            space,
            template,
            reference,
            workloads: Vec::new(),
            hitrates: Vec::new(),
            scenarios: Scenario::CANONICAL.to_vec(),
            scratch_root: None,
            next_trial: AtomicU64::new(0),
        }
    }

    pub fn with_workloads(mut self, workloads: Vec<WorkloadConfig>) -> Self {
        self.workloads = workloads;
        self
    }

    pub fn with_hitrates(mut self, hitrates: Vec<Hitrate>) -> Self {
        self.hitrates = hitrates;
        self
    }

    pub fn with_scenarios(mut self, scenarios: Vec<Scenario>) -> Self {
        self.scenarios = scenarios;
        self
    }

    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    /// Same setup scheduled on another coordinator
    pub fn fork(&self, coordinator: Arc<Coordinator>) -> Self {
        Self {
            simulator: self.simulator.clone(),
            coordinator,
            evaluator: self.evaluator.clone(),
            space: self.space.clone(),
            template: self.template.clone(),
            reference: self.reference.clone(),
            workloads: self.workloads.clone(),
            hitrates: self.hitrates.clone(),
            scenarios: self.scenarios.clone(),
            scratch_root: self.scratch_root.clone(),
            next_trial: AtomicU64::new(self.next_trial.load(Ordering::SeqCst)),
        }
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    /// Simulator runs needed by one full trial
    pub fn units_per_trial(&self) -> usize {
        self.scenarios.len() * self.workloads.len() * self.hitrates.len()
    }

    /// Evaluate `assignment`, abandoning it once its partial loss exceeds `reject_above`
    pub async fn evaluate(&self, assignment: &ParameterAssignment, reject_above: Option<f64>) -> TrialOutcome {
        let trial = self.next_trial.fetch_add(1, Ordering::SeqCst);
        debug!(trial, %assignment, "trial started");

        let outcome = match reject_above {
            None => match self.simulate(assignment, &self.scenarios, None).await {
                Ok(simulated) => self.score(&simulated).await,
                Err(invalid) => TrialOutcome::Invalid(invalid),
            },
            Some(threshold) => self.evaluate_staged(assignment, threshold).await,
        };

        match &outcome {
            TrialOutcome::Success { loss, report } => {
                info!(trial, loss, groups = report.compared_groups, "trial finished")
            }
            TrialOutcome::Rejected {
                partial_loss,
                completed_scenarios,
            } => info!(trial, partial_loss, completed_scenarios, "trial rejected early"),
            TrialOutcome::Invalid(invalid) => {
                warn!(trial, reason = ?invalid.reason, failures = invalid.failures.len(), "trial invalid");
                for failure in &invalid.failures {
                    warn!(trial, "{}", failure);
                }
            }
        }
        outcome
    }

    async fn evaluate_staged(&self, assignment: &ParameterAssignment, threshold: f64) -> TrialOutcome {
        let mut simulated = TraceSet::new();
        for (done, scenario) in self.scenarios.iter().enumerate() {
            match self.simulate(assignment, std::slice::from_ref(scenario), None).await {
                Ok(part) => {
                    for (s, index) in Vec::from(part) {
                        simulated.insert(s, index);
                    }
                }
                Err(invalid) => return TrialOutcome::Invalid(invalid),
            }
            if done + 1 == self.scenarios.len() {
                break;
            }
            let partial = match self.evaluator.evaluate(&self.reference, &simulated).await {
                Ok(report) => report,
                Err(e) => return TrialOutcome::Invalid(InvalidTrial::new(InvalidReason::LossEvaluation(e.to_string()))),
            };
            // nothing comparable yet says nothing about the final loss
            if !partial.is_degenerate() && partial.loss() > threshold {
                return TrialOutcome::Rejected {
                    partial_loss: partial.loss(),
                    completed_scenarios: done + 1,
                };
            }
        }
        self.score(&simulated).await
    }

    async fn score(&self, simulated: &TraceSet) -> TrialOutcome {
        match self.evaluator.evaluate(&self.reference, simulated).await {
            Ok(report) if report.is_degenerate() => TrialOutcome::Invalid(InvalidTrial::new(InvalidReason::DegenerateLoss)),
            Ok(report) => TrialOutcome::Success {
                loss: report.loss(),
                report,
            },
            Err(e) => TrialOutcome::Invalid(InvalidTrial::new(InvalidReason::LossEvaluation(e.to_string()))),
        }
    }

    fn scratch(&self) -> Result<TempDir, InvalidTrial> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("trial-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| InvalidTrial::new(InvalidReason::Scratch(e.to_string())))
    }

    /// Run every unit of `scenarios` and group the outputs
    ///
    /// With `persist` set, each raw output is also copied to its synthetic
    /// location in that reference layout.
    pub async fn simulate(
        &self,
        assignment: &ParameterAssignment,
        scenarios: &[Scenario],
        persist: Option<&ReferenceLayout>,
    ) -> Result<TraceSet, InvalidTrial> {
        let scratch = self.scratch()?;

        let mut platforms = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let values = PlatformValues::for_scenario(&self.space, assignment, *scenario);
            let file = self
                .template
                .materialize(&values, scratch.path())
                .map_err(|e| InvalidTrial::new(InvalidReason::Template(e.to_string())))?;
            platforms.push((*scenario, file));
        }

        let xrootd_flops = self.space.format(Param::XrootdFlops, assignment.get(Param::XrootdFlops));
        let mut units = Vec::new();
        let mut handles = Vec::new();
        for (scenario, platform) in &platforms {
            for workload in &self.workloads {
                for hitrate in &self.hitrates {
                    let request = SimulationRequest {
                        scenario: *scenario,
                        assignment: *assignment,
                        workload: workload.name.clone(),
                        dataset_config: workload.dataset.clone(),
                        workload_config: workload.workload.clone(),
                        hitrate: *hitrate,
                        platform: platform.path().to_path_buf(),
                        xrootd_flops: xrootd_flops.clone(),
                        scratch_dir: scratch.path().to_path_buf(),
                        keep_output: persist
                            .map(|layout| layout.synthetic_path(&workload.reference_dir(), *scenario, *hitrate)),
                    };
                    let simulator = self.simulator.clone();
                    handles.push(self.coordinator.submit(move |cancel: CancellationToken| async move {
                        simulator.run(&request, cancel).await
                    }));
                    units.push(Unit {
                        scenario: *scenario,
                        workload: workload.name.clone(),
                        hitrate: *hitrate,
                    });
                }
            }
        }

        let tokens: Vec<CancellationToken> = handles.iter().map(|h| h.token().clone()).collect();
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| self.coordinator.wait(handle).map(move |result| (i, result)))
            .collect();

        let mut aggregators: BTreeMap<Scenario, TraceAggregator> =
            scenarios.iter().map(|s| (*s, TraceAggregator::new())).collect();
        let mut failures = Vec::new();
        let mut cancelled = false;

        while let Some((i, result)) = pending.next().await {
            let unit = &units[i];
            let (error, output) = match result {
                Ok(Ok(traces)) => {
                    if let Some(aggregator) = aggregators.get_mut(&unit.scenario) {
                        aggregator.add(&unit.workload, unit.hitrate, traces);
                    }
                    continue;
                }
                Ok(Err(e)) if e.is_cancelled() => {
                    cancelled = true;
                    continue;
                }
                Ok(Err(e)) => {
                    let output = e.output().map(|(out, err)| (out.to_string(), err.to_string()));
                    (e.to_string(), output)
                }
                Err(WorkError::Cancelled) | Err(WorkError::DeadlineExceeded) => {
                    cancelled = true;
                    continue;
                }
                Err(e) => (e.to_string(), None),
            };

            if failures.is_empty() {
                // the trial is already lost, stop its siblings
                for token in &tokens {
                    token.cancel();
                }
            }
            let (stdout, stderr) = match output {
                Some((out, err)) => (Some(out), Some(err)),
                None => (None, None),
            };
            failures.push(ScenarioFailure {
                scenario: unit.scenario,
                workload: unit.workload.clone(),
                hitrate: unit.hitrate,
                error,
                stdout,
                stderr,
            });
        }
        drop(platforms);
        drop(scratch);

        if !failures.is_empty() {
            return Err(InvalidTrial {
                reason: InvalidReason::SimulationFailed,
                failures,
            });
        }
        if cancelled {
            return Err(InvalidTrial::new(InvalidReason::Cancelled));
        }

        let mut set = TraceSet::new();
        for (scenario, aggregator) in aggregators {
            set.insert(scenario, aggregator.finish());
        }
        Ok(set)
    }
}
