//! Simulator invocation
//!
//! `DcSim` runs the external simulator once per (scenario, workload,
//! hitrate) and parses the trace it writes. The output file lives in the
//! trial's scratch directory and is removed when the call returns. Each run
//! gets its own process group, which is killed on timeout or cancellation.

use async_trait::async_trait;
use job_traces::{Hitrate, MachineTraces, TraceError, TraceReader};
use platform_params::{ParameterAssignment, Scenario};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SimulatorConfig;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("failed to start simulator {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("simulator exited with {status}")]
    Process {
        status: String,
        stdout: String,
        stderr: String,
    },
    #[error("simulator produced an empty output file")]
    EmptyOutput { stdout: String, stderr: String },
    #[error("unreadable simulator output: {source}")]
    Trace {
        #[source]
        source: TraceError,
        stdout: String,
        stderr: String,
    },
    #[error("simulator exceeded {0:?} and was killed")]
    Timeout(Duration),
    #[error("simulation cancelled")]
    Cancelled,
    #[error("scratch file: {0}")]
    Io(#[from] std::io::Error),
}

impl SimulationError {
    /// Captured (stdout, stderr) of the failed process, when there was one
    pub fn output(&self) -> Option<(&str, &str)> {
        match self {
            SimulationError::Process { stdout, stderr, .. }
            | SimulationError::EmptyOutput { stdout, stderr }
            | SimulationError::Trace { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SimulationError::Cancelled)
    }
}

/// Everything one simulator run needs
#[derive(Debug, Clone)]
pub struct SimulationRequest {
    pub scenario: Scenario,
    pub assignment: ParameterAssignment,
    pub workload: String,
    pub dataset_config: PathBuf,
    pub workload_config: PathBuf,
    pub hitrate: Hitrate,
    pub platform: PathBuf,
    /// `xrootdFlops` formatted for the command line
    pub xrootd_flops: String,
    pub scratch_dir: PathBuf,
    /// Copy the raw output here before it is removed
    pub keep_output: Option<PathBuf>,
}

#[async_trait]
pub trait Simulator: Send + Sync {
    async fn run(&self, request: &SimulationRequest, cancel: CancellationToken) -> Result<MachineTraces, SimulationError>;
}

/// Fixed command-line settings of the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSettings {
    pub xrd_blocksize: u64,
    pub storage_buffer_size: u64,
    pub duplications: u32,
    pub loopback_bandwidth: u64,
    pub seed: u64,
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self::from(&SimulatorConfig::default())
    }
}

impl From<&SimulatorConfig> for InvocationSettings {
    fn from(config: &SimulatorConfig) -> Self {
        Self {
            xrd_blocksize: config.xrd_blocksize,
            storage_buffer_size: config.storage_buffer_size,
            duplications: config.duplications,
            loopback_bandwidth: config.loopback_bandwidth,
            seed: config.seed,
        }
    }
}

/// Subprocess driver for the external simulator
#[derive(Debug, Clone)]
pub struct DcSim {
    program: PathBuf,
    settings: InvocationSettings,
    timeout: Option<Duration>,
    reader: TraceReader,
}

impl DcSim {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            settings: InvocationSettings::default(),
            timeout: None,
            reader: TraceReader::new(),
        }
    }

    pub fn from_config(config: &SimulatorConfig, reader: TraceReader) -> Self {
        Self {
            program: config.program.clone(),
            settings: InvocationSettings::from(config),
            timeout: config.timeout(),
            reader,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_line(&self, request: &SimulationRequest, output: &Path) -> Vec<OsString> {
        let s = &self.settings;
        let mut args: Vec<OsString> = Vec::with_capacity(24);
        let mut flag = |name: &str, value: OsString| {
            args.push(name.into());
            args.push(value);
        };
        flag("--platform", request.platform.clone().into());
        flag("--output-file", output.into());
        flag("--workload-configurations", request.workload_config.clone().into());
        flag("--dataset-configurations", request.dataset_config.clone().into());
        flag("--hitrate", request.hitrate.to_string().into());
        flag("--xrd-blocksize", s.xrd_blocksize.to_string().into());
        flag("--storage-buffer-size", s.storage_buffer_size.to_string().into());
        flag("--duplications", s.duplications.to_string().into());
        args.push(format!("--cfg=network/loopback-bw:{}", s.loopback_bandwidth).into());
        args.push("--no-caching".into());
        args.push("--seed".into());
        args.push(s.seed.to_string().into());
        args.push("--xrd-flops-per-time".into());
        args.push(request.xrootd_flops.clone().into());
        args
    }

    fn read_output(&self, path: &Path, stdout: String, stderr: String) -> Result<MachineTraces, SimulationError> {
        match self.reader.read_path(path) {
            Ok(traces) => Ok(traces),
            Err(TraceError::EmptyOutput(_)) => Err(SimulationError::EmptyOutput { stdout, stderr }),
            Err(source) => Err(SimulationError::Trace { source, stdout, stderr }),
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "simulator pipe closed early");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: JoinHandle<String>) -> String {
    task.await.unwrap_or_default()
}

/// Kills the simulator's whole process group unless disarmed
///
/// The simulator leads its own group, so wrapper scripts and anything they
/// spawned go down with it.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "failed to kill simulator process group"),
            }
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn terminate(child: &mut Child, group: &mut ProcessGroup, readers: [JoinHandle<String>; 2]) {
    group.kill();
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill simulator");
    }
    for reader in readers {
        reader.abort();
    }
}

#[async_trait]
impl Simulator for DcSim {
    async fn run(&self, request: &SimulationRequest, cancel: CancellationToken) -> Result<MachineTraces, SimulationError> {
        if cancel.is_cancelled() {
            return Err(SimulationError::Cancelled);
        }

        let output = tempfile::Builder::new()
            .prefix("dcsim-")
            .suffix(".csv")
            .tempfile_in(&request.scratch_dir)?;

        let mut child = Command::new(&self.program)
            .args(self.command_line(request, output.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SimulationError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        debug!(
            pid = child.id(),
            scenario = %request.scenario,
            workload = %request.workload,
            hitrate = %request.hitrate,
            "simulator started"
        );

        let mut group = ProcessGroup::of(&child);

        let readers = [
            tokio::spawn(drain(child.stdout.take())),
            tokio::spawn(drain(child.stderr.take())),
        ];
        let limit = self.timeout;
        let expiry = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => {
                group.disarm();
                status?
            }
            _ = cancel.cancelled() => {
                terminate(&mut child, &mut group, readers).await;
                return Err(SimulationError::Cancelled);
            }
            _ = expiry => {
                terminate(&mut child, &mut group, readers).await;
                warn!(workload = %request.workload, hitrate = %request.hitrate, "simulator timed out");
                return Err(SimulationError::Timeout(limit.unwrap_or_default()));
            }
        };

        let [out_task, err_task] = readers;
        let stdout = collect(out_task).await;
        let stderr = collect(err_task).await;

        if !status.success() {
            return Err(SimulationError::Process {
                status: status.to_string(),
                stdout,
                stderr,
            });
        }

        let traces = self.read_output(output.path(), stdout, stderr)?;
        if let Some(dest) = &request.keep_output {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(output.path(), dest)?;
        }
        if !traces.skipped.is_empty() {
            warn!(
                workload = %request.workload,
                hitrate = %request.hitrate,
                skipped = traces.skipped.len(),
                "simulator output had malformed rows"
            );
        }
        Ok(traces)
    }
}
