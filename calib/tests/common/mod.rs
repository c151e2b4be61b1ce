#![allow(dead_code)]

use async_trait::async_trait;
use calib::config::WorkloadConfig;
use calib::coordinator::Coordinator;
use calib::invoker::{SimulationError, SimulationRequest, Simulator};
use calib::trial::TrialRunner;
use job_traces::{Hitrate, JobRecord, MachineTraces, TraceAggregator, TraceSet};
use platform_params::{Param, ParameterAssignment, ParameterSpace, PlatformTemplate, Scenario};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trace_loss::{LossEvaluator, Metric};

pub const TEMPLATE: &str =
    "<host speed=\"{cpu-speed}\"/><disk read=\"{read-speed}\"/><link bw=\"{link-speed}\"/><wan bw=\"{net-speed}\"/>";

pub const CSV_HEADER: &str = "job.tag,\tmachine.name,\tjob.start,\tjob.end,\tjob.computetime,\tinfiles.transfertime,\toutfiles.transfertime";

/// Write an executable `sh` script standing in for the simulator
///
/// `$out` holds the `--output-file` argument and `$hitrate` the hitrate.
pub fn fake_simulator(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    --output-file) out=\"$2\"; shift 2;;\n    --hitrate) hitrate=\"$2\"; shift 2;;\n    *) shift;;\n  esac\ndone\n{}\n",
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn workloads() -> Vec<WorkloadConfig> {
    vec![WorkloadConfig {
        name: "test".into(),
        dir: "testjob".into(),
        dataset: "ds.json".into(),
        workload: "wl.json".into(),
    }]
}

pub fn hitrates(values: &[f64]) -> Vec<Hitrate> {
    values.iter().map(|h| Hitrate::new(*h).unwrap()).collect()
}

/// Walltime of a job as a known function of the platform speeds
pub fn model_walltime(assignment: &ParameterAssignment, scenario: Scenario, hitrate: Hitrate, job: usize) -> f64 {
    let h = hitrate.value();
    let base = 1e11 / assignment.get(Param::CpuSpeed)
        + h * 5e10 / scenario.cache_speed(assignment)
        + (1.0 - h) * 5e10 / scenario.external_network_speed(assignment);
    base * (1.0 + 0.1 * job as f64)
}

pub fn model_traces(assignment: &ParameterAssignment, scenario: Scenario, hitrate: Hitrate) -> MachineTraces {
    let mut traces = MachineTraces::default();
    for machine in ["sg01", "sg02"] {
        for job in 0..5 {
            let wall = model_walltime(assignment, scenario, hitrate, job);
            traces.push(JobRecord {
                start: 10.0,
                end: 10.0 + wall,
                compute_time: wall * 0.6,
                input_transfer_time: wall * 0.3,
                output_transfer_time: 1.0,
                machine_name: machine.to_string(),
                job_tag: format!("job_{}", job),
            });
        }
    }
    traces
}

pub fn model_reference(assignment: &ParameterAssignment, workloads: &[WorkloadConfig], hitrates: &[Hitrate]) -> TraceSet {
    let mut set = TraceSet::new();
    for scenario in Scenario::CANONICAL {
        let mut aggregator = TraceAggregator::new();
        for workload in workloads {
            for hitrate in hitrates {
                aggregator.add(&workload.name, *hitrate, model_traces(assignment, scenario, *hitrate));
            }
        }
        set.insert(scenario, aggregator.finish());
    }
    set
}

type FailRule = Box<dyn Fn(&SimulationRequest) -> bool + Send + Sync>;

/// In-memory simulator following `model_walltime`
pub struct ModelSimulator {
    pub calls: AtomicUsize,
    pub delay: Duration,
    fail: FailRule,
}

impl ModelSimulator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: Box::new(|_| false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_when(mut self, rule: impl Fn(&SimulationRequest) -> bool + Send + Sync + 'static) -> Self {
        self.fail = Box::new(rule);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Simulator for ModelSimulator {
    async fn run(&self, request: &SimulationRequest, cancel: CancellationToken) -> Result<MachineTraces, SimulationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(SimulationError::Cancelled),
            }
        }
        if (self.fail)(request) {
            return Err(SimulationError::Process {
                status: "exit status: 1".into(),
                stdout: String::new(),
                stderr: "boom".into(),
            });
        }
        Ok(model_traces(&request.assignment, request.scenario, request.hitrate))
    }
}

pub fn runner(
    simulator: Arc<dyn Simulator>,
    coordinator: Coordinator,
    space: ParameterSpace,
    reference: TraceSet,
    hitrate_values: &[f64],
) -> TrialRunner {
    TrialRunner::new(
        simulator,
        Arc::new(coordinator),
        LossEvaluator::InProcess(Metric::Mre),
        Arc::new(space),
        Arc::new(PlatformTemplate::new(TEMPLATE)),
        Arc::new(reference),
    )
    .with_workloads(workloads())
    .with_hitrates(hitrates(hitrate_values))
}
