//! Command-line plumbing shared by the binaries

use anyhow::{Context, Result};
use clap::Args;
use job_traces::TraceSet;
use platform_params::{ParameterAssignment, PlatformTemplate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use trace_loss::Metric;

use crate::config::{Algorithm, CalibrationConfig};
use crate::invoker::DcSim;
use crate::trial::TrialRunner;

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Concurrent simulator processes
    #[arg(long)]
    pub workers: Option<usize>,

    /// Wall-clock budget in seconds
    #[arg(long)]
    pub time_limit: Option<f64>,

    /// Loss metric (mre, ratio, energy, wasserstein, hausdorff, chamfer, sorted, double)
    #[arg(long)]
    pub loss: Option<Metric>,

    /// Evaluate losses in a separate worker process
    #[arg(long, default_value_t = false)]
    pub isolated: bool,

    /// Simulator executable
    #[arg(long)]
    pub simulator: Option<PathBuf>,

    /// Platform template file
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// Root of the reference trace tree
    #[arg(long)]
    pub reference: Option<PathBuf>,

    /// Pin the CPU speed instead of searching it
    #[arg(long, default_value_t = false)]
    pub no_cpu: bool,

    /// Search only the slow external network; fast = ratio * slow
    #[arg(long)]
    pub network_ratio: Option<f64>,
}

impl CommonArgs {
    /// Load the configuration file and apply command-line overrides
    pub fn load(&self) -> Result<CalibrationConfig> {
        let mut config = match &self.config {
            Some(path) => CalibrationConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => CalibrationConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.coordinator.workers = workers;
        }
        if let Some(limit) = self.time_limit {
            config.coordinator.time_limit_secs = Some(limit);
        }
        if let Some(metric) = self.loss {
            config.loss.metric = metric;
        }
        if self.isolated {
            config.loss.isolated = true;
        }
        if let Some(program) = &self.simulator {
            config.simulator.program = program.clone();
        }
        if let Some(template) = &self.template {
            config.simulator.template = template.clone();
        }
        if let Some(root) = &self.reference {
            config.reference.root = root.clone();
        }
        if self.no_cpu {
            config.space = config.space.pin_cpu();
        }
        if let Some(ratio) = self.network_ratio {
            config.space = config.space.with_network_ratio(ratio);
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// gradient, random, grid or surrogate
    #[arg(long)]
    pub algorithm: Option<Algorithm>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Starting assignment (JSON map of parameter name to value)
    #[arg(long)]
    pub start: Option<PathBuf>,
}

impl SearchArgs {
    pub fn apply(&self, config: &mut CalibrationConfig) -> Result<()> {
        if let Some(algorithm) = self.algorithm {
            config.search.algorithm = algorithm;
        }
        if let Some(seed) = self.seed {
            config.search.seed = seed;
        }
        if let Some(path) = &self.start {
            config.search.start = Some(read_assignment(path)?);
        }
        Ok(())
    }
}

pub fn read_assignment(path: &Path) -> Result<ParameterAssignment> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing assignment {}", path.display()))
}

/// Assignment from a calibration result file (its `best`) or a bare assignment file
pub fn read_calibrated(path: &Path) -> Result<ParameterAssignment> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(best) = value.get_mut("best") {
        value = best.take();
    }
    serde_json::from_value(value).with_context(|| format!("no assignment in {}", path.display()))
}

/// Write pretty JSON to `path`, or to stdout when absent
pub fn emit<T: serde::Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => std::fs::write(path, text + "\n").with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", text),
    }
    Ok(())
}

/// Wire a trial runner from configuration
///
/// Without `with_reference` the runner only simulates; its reference set is
/// empty.
pub fn build_runner(config: &CalibrationConfig, with_reference: bool) -> Result<TrialRunner> {
    let space = config.space()?;
    let template = PlatformTemplate::load(&config.simulator.template)
        .with_context(|| format!("loading platform template {}", config.simulator.template.display()))?;

    let reference = if with_reference {
        let layout = config.reference.layout(&config.simulator.workloads);
        let set = layout
            .load()
            .with_context(|| format!("loading reference traces from {}", layout.root.display()))?;
        if set.is_empty() {
            anyhow::bail!("no reference traces found under {}", layout.root.display());
        }
        info!(groups = set.group_count(), "reference traces loaded");
        set
    } else {
        TraceSet::new()
    };

    let simulator = DcSim::from_config(&config.simulator, config.reference.reader());
    Ok(TrialRunner::new(
        Arc::new(simulator),
        Arc::new(config.coordinator()),
        config.evaluator(),
        Arc::new(space),
        Arc::new(template),
        Arc::new(reference),
    )
    .with_workloads(config.simulator.workloads.clone())
    .with_hitrates(config.simulator.hitrates()?)
    .with_scratch_root(config.simulator.scratch_dir.clone()))
}
