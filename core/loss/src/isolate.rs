//! Loss evaluation in a separate worker process
//!
//! Each request spawns one `loss-worker`, writes a request frame to its
//! stdin and reads exactly one response frame from its stdout.

use crate::frame::{Frame, FrameError, FrameKind};
use crate::{LossReport, LossRequest, Metric};
use job_traces::TraceSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("failed to spawn loss worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("loss worker io: {0}")]
    Io(#[from] std::io::Error),
    #[error("loss worker exceeded {0:?} and was killed")]
    Timeout(Duration),
    #[error("loss worker exited with {status}: {stderr}")]
    Worker { status: String, stderr: String },
    #[error("loss worker reported: {0}")]
    Remote(String),
    #[error("unexpected {0:?} frame from loss worker")]
    UnexpectedFrame(FrameKind),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("loss worker pool is closed")]
    Closed,
}

/// Bounded pool of one-shot loss worker processes
#[derive(Debug)]
pub struct LossWorkerPool {
    program: PathBuf,
    permits: Semaphore,
    timeout: Duration,
}

impl LossWorkerPool {
    pub fn new(program: impl Into<PathBuf>, workers: usize, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            permits: Semaphore::new(workers.max(1)),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub async fn evaluate(&self, request: &LossRequest) -> Result<LossReport, IsolationError> {
        let _permit = self.permits.acquire().await.map_err(|_| IsolationError::Closed)?;
        let bytes = Frame::encode(FrameKind::Request, request)?.to_bytes();

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| IsolationError::Io(std::io::Error::other("worker stdin not captured")))?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&bytes).await?;
            stdin.shutdown().await
        });

        // Dropping the wait future drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                writer.abort();
                warn!(timeout = ?self.timeout, "loss worker timed out");
                return Err(IsolationError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            return Err(IsolationError::Worker {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        match writer.await {
            Ok(result) => result?,
            Err(e) => return Err(IsolationError::Io(std::io::Error::other(e))),
        }

        let frame = Frame::from_bytes(&output.stdout)?;
        match frame.kind {
            FrameKind::Response => {
                let report: LossReport = frame.decode()?;
                debug!(loss = report.loss(), groups = report.compared_groups, "isolated loss");
                Ok(report)
            }
            FrameKind::Failure => Err(IsolationError::Remote(frame.decode()?)),
            other => Err(IsolationError::UnexpectedFrame(other)),
        }
    }
}

/// Where a trial's loss gets computed
#[derive(Debug, Clone)]
pub enum LossEvaluator {
    InProcess(Metric),
    Isolated { metric: Metric, pool: Arc<LossWorkerPool> },
}

impl LossEvaluator {
    pub fn metric(&self) -> Metric {
        match self {
            LossEvaluator::InProcess(metric) => *metric,
            LossEvaluator::Isolated { metric, .. } => *metric,
        }
    }

    pub async fn evaluate(&self, reference: &TraceSet, simulated: &TraceSet) -> Result<LossReport, IsolationError> {
        match self {
            LossEvaluator::InProcess(metric) => Ok(metric.evaluate(reference, simulated)),
            LossEvaluator::Isolated { metric, pool } => {
                let request = LossRequest {
                    metric: *metric,
                    reference: reference.clone(),
                    simulated: simulated.clone(),
                };
                pool.evaluate(&request).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let pool = LossWorkerPool::new("/nonexistent/loss-worker", 1, Duration::from_secs(5));
        let request = LossRequest {
            metric: Metric::Mre,
            reference: TraceSet::new(),
            simulated: TraceSet::new(),
        };
        assert!(matches!(pool.evaluate(&request).await, Err(IsolationError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_in_process_evaluator() {
        let evaluator = LossEvaluator::InProcess(Metric::Chamfer);
        let report = evaluator.evaluate(&TraceSet::new(), &TraceSet::new()).await.unwrap();
        assert!(report.is_degenerate());
        assert_eq!(evaluator.metric(), Metric::Chamfer);
    }
}
