//! Simulator calibration engine
//!
//! Searches platform parameters so that simulated job traces match measured
//! ones. A `Calibrator` proposes assignments through a `SearchStrategy`, a
//! `TrialRunner` evaluates each one across all scenarios, workloads and
//! hitrates on the `Coordinator`, and `trace_loss` reduces the outputs to a
//! single loss.

pub mod calibrator;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod invoker;
pub mod strategy;
pub mod sweep;
pub mod trial;

pub use calibrator::{CalibrationError, CalibrationResult, CalibrationState, Calibrator, Phase, Termination};
pub use config::{CalibrationConfig, ConfigError};
pub use coordinator::{Coordinator, WorkError};
pub use invoker::{DcSim, SimulationError, SimulationRequest, Simulator};
pub use strategy::{strategy_for, SearchStrategy};
pub use sweep::{sweep_epsilon, SweepResult};
pub use trial::{InvalidReason, InvalidTrial, ScenarioFailure, TrialOutcome, TrialRunner};

/// Log to stderr, `info` unless `RUST_LOG` says otherwise
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
