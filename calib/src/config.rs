//! Calibration configuration
//!
//! One JSON document; every section falls back to the defaults of the
//! reference validation setup so a minimal file is enough.

use job_traces::{Hitrate, ReferenceLayout, TraceReader, WorkloadDir, DEFAULT_INTERNAL_MARKER};
use platform_params::{ParamError, ParameterAssignment, ParameterSpace, ParameterSpaceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use trace_loss::{LossEvaluator, LossWorkerPool, Metric};

use crate::coordinator::Coordinator;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// One simulated workload and where its reference data lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    /// Directory under the reference root, e.g. `testjob`
    pub dir: String,
    pub dataset: PathBuf,
    pub workload: PathBuf,
}

impl WorkloadConfig {
    pub fn reference_dir(&self) -> WorkloadDir {
        WorkloadDir::new(&self.name, &self.dir)
    }
}

fn default_workloads() -> Vec<WorkloadConfig> {
    vec![
        WorkloadConfig {
            name: "test".into(),
            dir: "testjob".into(),
            dataset: "data/dataset-configs/crown_ttbar_testjob.json".into(),
            workload: "data/workload-configs/crown_ttbar_testjob.json".into(),
        },
        WorkloadConfig {
            name: "copy".into(),
            dir: "copyjob".into(),
            dataset: "data/dataset-configs/crown_ttbar_copyjob.json".into(),
            workload: "data/workload-configs/crown_ttbar_copyjob_no_cpu.json".into(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub program: PathBuf,
    pub template: PathBuf,
    pub workloads: Vec<WorkloadConfig>,
    pub hitrates: Vec<f64>,
    pub xrd_blocksize: u64,
    pub storage_buffer_size: u64,
    pub duplications: u32,
    pub loopback_bandwidth: u64,
    pub seed: u64,
    /// Per-invocation limit on top of the global deadline
    pub timeout_secs: Option<f64>,
    /// Parent of the per-trial scratch directories (system temp if unset)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            program: "dc-sim".into(),
            template: "data/platform-files/sgbatch_validation_template.xml".into(),
            workloads: default_workloads(),
            hitrates: (0..=10).rev().map(|i| i as f64 / 10.0).collect(),
            xrd_blocksize: 10_000_000_000,
            storage_buffer_size: 0,
            duplications: 48,
            loopback_bandwidth: 100_000_000_000_000,
            seed: 0,
            timeout_secs: None,
            scratch_dir: None,
        }
    }
}

impl SimulatorConfig {
    pub fn hitrates(&self) -> Result<Vec<Hitrate>, ConfigError> {
        self.hitrates
            .iter()
            .map(|h| Hitrate::new(*h).ok_or_else(|| ConfigError::Invalid(format!("hitrate {} outside [0, 1]", h))))
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}

fn default_marker() -> Option<String> {
    Some(DEFAULT_INTERNAL_MARKER.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub root: PathBuf,
    pub site_prefix: String,
    /// `job.tag` substring of rows never compared; null keeps every row
    #[serde(default = "default_marker")]
    pub internal_marker: Option<String>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            root: "ground-truth/data".into(),
            site_prefix: "SG".into(),
            internal_marker: default_marker(),
        }
    }
}

impl ReferenceConfig {
    pub fn reader(&self) -> TraceReader {
        TraceReader::new().with_internal_marker(self.internal_marker.clone())
    }

    pub fn layout(&self, workloads: &[WorkloadConfig]) -> ReferenceLayout {
        let dirs = workloads.iter().map(WorkloadConfig::reference_dir).collect();
        let mut layout = ReferenceLayout::new(&self.root, dirs).with_reader(self.reader());
        layout.site_prefix = self.site_prefix.clone();
        layout
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub metric: Metric,
    /// Evaluate in a `loss-worker` child process
    pub isolated: bool,
    /// Worker binary; defaults to `loss-worker` next to the running executable
    pub worker: Option<PathBuf>,
    pub worker_timeout_secs: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            isolated: false,
            worker: None,
            worker_timeout_secs: 600.0,
        }
    }
}

impl LossConfig {
    pub fn worker_program(&self) -> PathBuf {
        if let Some(path) = &self.worker {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("loss-worker")))
            .unwrap_or_else(|| PathBuf::from("loss-worker"))
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub workers: usize,
    /// Wall-clock budget of the whole calibration
    pub time_limit_secs: Option<f64>,
    /// How long cancelled work may take to wind down
    pub grace_secs: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            time_limit_secs: None,
            grace_secs: 5.0,
        }
    }
}

impl CoordinatorConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs_f64)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs_f64(self.grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    #[serde(alias = "grad")]
    Gradient,
    Random,
    Grid,
    #[serde(alias = "gp")]
    Surrogate,
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gradient" | "grad" => Ok(Algorithm::Gradient),
            "random" => Ok(Algorithm::Random),
            "grid" => Ok(Algorithm::Grid),
            "surrogate" | "gp" => Ok(Algorithm::Surrogate),
            other => Err(format!("unknown algorithm: {}", other)),
        }
    }
}

/// What happens to the in-flight round when the time limit passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineMode {
    /// Let the round finish, then stop
    Soft,
    /// Cancel outstanding simulations
    #[default]
    Hard,
}

impl DeadlineMode {
    /// Whether the coordinator enforces the time limit by cancelling work
    pub fn cancels_in_flight(&self) -> bool {
        matches!(self, DeadlineMode::Hard)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientConfig {
    pub epsilon: f64,
    pub min_epsilon: f64,
    pub grow: f64,
    pub decay: f64,
    pub patience: Option<usize>,
    pub both_directions: bool,
}

impl Default for GradientConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.5,
            min_epsilon: 1e-3,
            grow: 1.5,
            decay: 0.5,
            patience: None,
            both_directions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    pub batch: usize,
    pub max_evaluations: Option<usize>,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            batch: 8,
            max_evaluations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub batch: usize,
    pub max_level: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { batch: 16, max_level: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    pub initial_points: usize,
    pub batch: usize,
    pub candidates: usize,
    pub length_scale: f64,
    pub noise: f64,
    /// Exploration margin of expected improvement
    pub xi: f64,
    pub max_evaluations: Option<usize>,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            initial_points: 10,
            batch: 4,
            candidates: 2000,
            length_scale: 0.2,
            noise: 1e-6,
            xi: 0.01,
            max_evaluations: Some(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub algorithm: Algorithm,
    pub seed: u64,
    /// Starting point; sampled from the prior when absent
    pub start: Option<ParameterAssignment>,
    pub deadline: DeadlineMode,
    pub early_reject_loss: Option<f64>,
    pub early_reject_factor: Option<f64>,
    pub max_invalid_rounds: usize,
    pub max_rounds: Option<usize>,
    pub gradient: GradientConfig,
    pub random: RandomConfig,
    pub grid: GridConfig,
    pub surrogate: SurrogateConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            seed: 0,
            start: None,
            deadline: DeadlineMode::default(),
            early_reject_loss: None,
            early_reject_factor: None,
            max_invalid_rounds: 3,
            max_rounds: None,
            gradient: GradientConfig::default(),
            random: RandomConfig::default(),
            grid: GridConfig::default(),
            surrogate: SurrogateConfig::default(),
        }
    }
}

impl SearchConfig {
    /// Loss above which a candidate is abandoned at a scenario boundary
    pub fn reject_threshold(&self, best_loss: f64) -> Option<f64> {
        let relative = self
            .early_reject_factor
            .filter(|_| best_loss.is_finite())
            .map(|factor| best_loss * factor);
        match (self.early_reject_loss, relative) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub simulator: SimulatorConfig,
    pub reference: ReferenceConfig,
    pub loss: LossConfig,
    pub coordinator: CoordinatorConfig,
    pub space: ParameterSpaceConfig,
    pub search: SearchConfig,
}

impl CalibrationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.coordinator.workers == 0 {
            return invalid("coordinator.workers must be at least 1");
        }
        if self.simulator.workloads.is_empty() {
            return invalid("simulator.workloads is empty");
        }
        if self.simulator.hitrates.is_empty() {
            return invalid("simulator.hitrates is empty");
        }
        self.simulator.hitrates()?;
        if self.coordinator.time_limit_secs.is_some_and(|t| !(t.is_finite() && t > 0.0)) {
            return invalid("coordinator.time_limit_secs must be positive");
        }
        if !(self.coordinator.grace_secs.is_finite() && self.coordinator.grace_secs >= 0.0) {
            return invalid("coordinator.grace_secs must be non-negative");
        }
        if self.simulator.timeout_secs.is_some_and(|t| !(t.is_finite() && t > 0.0)) {
            return invalid("simulator.timeout_secs must be positive");
        }
        if !(self.loss.worker_timeout_secs.is_finite() && self.loss.worker_timeout_secs > 0.0) {
            return invalid("loss.worker_timeout_secs must be positive");
        }
        let g = &self.search.gradient;
        if !(g.epsilon > 0.0 && g.min_epsilon > 0.0 && g.grow >= 1.0 && g.decay > 0.0 && g.decay < 1.0) {
            return invalid("search.gradient needs epsilon, min_epsilon > 0, grow >= 1, 0 < decay < 1");
        }
        let positive = |v: Option<f64>| v.map_or(true, |v| v.is_finite() && v > 0.0);
        if !positive(self.search.early_reject_factor) {
            return invalid("search.early_reject_factor must be positive");
        }
        if !positive(self.search.early_reject_loss) {
            return invalid("search.early_reject_loss must be positive");
        }
        if self.search.random.batch == 0 || self.search.grid.batch == 0 || self.search.surrogate.batch == 0 {
            return invalid("search batch sizes must be at least 1");
        }
        if self.search.surrogate.length_scale <= 0.0 {
            return invalid("search.surrogate.length_scale must be positive");
        }
        self.space()?;
        Ok(())
    }

    pub fn space(&self) -> Result<ParameterSpace, ConfigError> {
        Ok(ParameterSpace::new(self.space.clone())?)
    }

    /// Loss evaluation as configured, in process or through worker processes
    pub fn evaluator(&self) -> LossEvaluator {
        if self.loss.isolated {
            let pool = LossWorkerPool::new(
                self.loss.worker_program(),
                self.coordinator.workers,
                Duration::from_secs_f64(self.loss.worker_timeout_secs),
            );
            LossEvaluator::Isolated {
                metric: self.loss.metric,
                pool: Arc::new(pool),
            }
        } else {
            LossEvaluator::InProcess(self.loss.metric)
        }
    }

    /// Coordinator enforcing the time limit only in hard deadline mode
    pub fn coordinator(&self) -> Coordinator {
        let limit = if self.search.deadline.cancels_in_flight() {
            self.coordinator.time_limit()
        } else {
            None
        };
        Coordinator::new(self.coordinator.workers, limit, self.coordinator.grace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: CalibrationConfig = serde_json::from_str(r#"{"search": {"algorithm": "grad"}}"#).unwrap();
        assert_eq!(config.simulator.hitrates.len(), 11);
        assert_eq!(config.simulator.hitrates[0], 1.0);
        assert_eq!(config.simulator.hitrates[10], 0.0);
        assert_eq!(config.search.algorithm, Algorithm::Gradient);
        assert_eq!(config.search.gradient.epsilon, 0.5);
        assert_eq!(config.reference.internal_marker.as_deref(), Some("__"));
        assert_eq!(config.space().unwrap().dims(), 7);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.json");
        std::fs::write(
            &path,
            r#"{
                "loss": {"metric": "ddks"},
                "coordinator": {"workers": 3, "time_limit_secs": 60},
                "reference": {"internal_marker": null},
                "space": {"params": [
                    {"param": "cpuSpeed", "prior": {"low": 20, "high": 40}},
                    {"param": "disk", "prior": {"low": 20, "high": 33}},
                    {"param": "ramDisk", "prior": {"low": 20, "high": 40}},
                    {"param": "internalNetwork", "prior": {"low": 20, "high": 33}},
                    {"param": "externalNetwork", "prior": {"low": 20, "high": 33}},
                    {"param": "xrootd_flops", "prior": {"low": 20, "high": 47}}
                ], "network_ratio": 10.0}
            }"#,
        )
        .unwrap();
        let config = CalibrationConfig::load(&path).unwrap();
        assert_eq!(config.loss.metric, Metric::Energy);
        assert_eq!(config.coordinator.workers, 3);
        assert_eq!(config.coordinator.time_limit(), Some(Duration::from_secs(60)));
        assert_eq!(config.reference.internal_marker, None);
        assert_eq!(config.space().unwrap().dims(), 6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CalibrationConfig::default();
        config.simulator.hitrates = vec![1.5];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CalibrationConfig::default();
        config.coordinator.workers = 0;
        assert!(config.validate().is_err());

        let mut config = CalibrationConfig::default();
        config.space.params.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Param(ParamError::Empty))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(CalibrationConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_reject_threshold() {
        let mut search = SearchConfig::default();
        assert_eq!(search.reject_threshold(0.4), None);
        search.early_reject_loss = Some(1.0);
        assert_eq!(search.reject_threshold(f64::INFINITY), Some(1.0));
        search.early_reject_factor = Some(2.0);
        assert_eq!(search.reject_threshold(0.4), Some(0.8));
        assert_eq!(search.reject_threshold(0.7), Some(1.0));
    }

    #[test]
    fn test_reject_settings_validated() {
        for factor in [0.0, -1.5, f64::NAN, f64::INFINITY] {
            let mut config = CalibrationConfig::default();
            config.search.early_reject_factor = Some(factor);
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "factor {}", factor);
        }
        let mut config = CalibrationConfig::default();
        config.search.early_reject_loss = Some(0.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CalibrationConfig::default();
        config.search.early_reject_factor = Some(1.2);
        config.search.early_reject_loss = Some(5.0);
        config.validate().unwrap();
    }
}
