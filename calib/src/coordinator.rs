//! Bounded-concurrency executor with a global deadline
//!
//! Work runs on tokio tasks gated by a semaphore. Every unit gets a child of
//! the coordinator's cancellation token; the deadline watchdog cancels the
//! root, which reaches every subprocess still running.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkError {
    #[error("work was cancelled before it finished")]
    Cancelled,
    #[error("global deadline exceeded")]
    DeadlineExceeded,
    #[error("coordinator is shut down")]
    Closed,
    #[error("work panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Snapshot of the coordinator's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub submitted: usize,
    pub completed: usize,
    pub active: usize,
    /// Highest number of units that ever ran at once
    pub peak: usize,
}

struct ActiveGuard(Arc<Counters>);

impl ActiveGuard {
    fn enter(counters: Arc<Counters>) -> Self {
        let now = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle to one submitted unit of work
pub struct WorkHandle<T> {
    join: JoinHandle<Result<T, WorkError>>,
    token: CancellationToken,
}

impl<T> WorkHandle<T> {
    /// Ask this unit alone to stop
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub struct Coordinator {
    permits: Arc<Semaphore>,
    workers: usize,
    deadline: Option<Instant>,
    grace: Duration,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    watchdog: Once,
}

impl Coordinator {
    /// `time_limit` counts from construction
    pub fn new(workers: usize, time_limit: Option<Duration>, grace: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            deadline: time_limit.map(|limit| Instant::now() + limit),
            grace,
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            watchdog: Once::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel everything submitted, now and later
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            peak: self.counters.peak.load(Ordering::SeqCst),
        }
    }

    fn arm_watchdog(&self) {
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => return,
        };
        self.watchdog.call_once(|| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!("global deadline reached, cancelling outstanding work");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        });
    }

    /// Queue `work`; it starts once a worker slot is free
    ///
    /// The closure receives the unit's cancellation token and is expected to
    /// stop (killing any child process) once it fires.
    pub fn submit<F, Fut, T>(&self, work: F) -> WorkHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.arm_watchdog();
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);

        let token = self.cancel.child_token();
        let task_token = token.clone();
        let permits = self.permits.clone();
        let counters = self.counters.clone();

        let join = tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(WorkError::Closed),
                },
                _ = task_token.cancelled() => return Err(WorkError::Cancelled),
            };
            let _active = ActiveGuard::enter(counters);
            Ok::<T, WorkError>(work(task_token).await)
        });
        WorkHandle { join, token }
    }

    /// Wait for one unit, giving up at the global deadline
    ///
    /// A unit that finished before the deadline is returned even if the
    /// deadline has passed since. On expiry all work is cancelled and this
    /// unit gets `grace` to wind down before its task is aborted.
    pub async fn wait<T>(&self, handle: WorkHandle<T>) -> Result<T, WorkError> {
        let WorkHandle { mut join, token } = handle;
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            result = &mut join => flatten(result),
            _ = expiry => {
                self.cancel.cancel();
                token.cancel();
                match tokio::time::timeout(self.grace, &mut join).await {
                    Ok(_) => debug!("work wound down after deadline"),
                    Err(_) => {
                        warn!(grace = ?self.grace, "work ignored cancellation, aborting task");
                        join.abort();
                    }
                }
                Err(WorkError::DeadlineExceeded)
            }
        }
    }

    pub async fn wait_all<T>(&self, handles: Vec<WorkHandle<T>>) -> Vec<Result<T, WorkError>> {
        futures::future::join_all(handles.into_iter().map(|h| self.wait(h))).await
    }
}

fn flatten<T>(result: Result<Result<T, WorkError>, JoinError>) -> Result<T, WorkError> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(WorkError::Cancelled),
        Err(e) => Err(WorkError::Panicked(e.to_string())),
    }
}
