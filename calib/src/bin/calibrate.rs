//! Calibrate platform parameters against reference traces

use anyhow::Result;
use calib::cli::{build_runner, emit, CommonArgs, SearchArgs};
use calib::config::DeadlineMode;
use calib::sweep::{decades, sweep_epsilon};
use calib::{init_tracing, CalibrationError, Calibrator};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "calibrate", about = "Search simulator platform parameters that reproduce measured job traces")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    search: SearchArgs,

    /// Let the running round finish when the time limit passes
    #[arg(long, default_value_t = false)]
    soft_deadline: bool,

    /// Sweep the gradient step size from this decade upward instead of calibrating once
    #[arg(long, requires = "sweep_high")]
    sweep_low: Option<f64>,

    /// Last decade of the step-size sweep
    #[arg(long, requires = "sweep_low")]
    sweep_high: Option<f64>,

    /// Write the result as JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = cli.common.load()?;
    cli.search.apply(&mut config)?;
    if cli.soft_deadline {
        config.search.deadline = DeadlineMode::Soft;
    }

    let runner = build_runner(&config, true)?;

    if let (Some(low), Some(high)) = (cli.sweep_low, cli.sweep_high) {
        let epsilons = decades(low, high)?;
        let sweep = sweep_epsilon(&runner, &config, &epsilons).await;
        match sweep.best_epsilon {
            Some(epsilon) => info!(epsilon, loss = sweep.best_loss, "best step size"),
            None => error!("no sweep run produced a valid calibration"),
        }
        return emit(&sweep, cli.output.as_deref());
    }

    let calibrator = Calibrator::new(runner, config.search.clone()).with_time_limit(config.coordinator.time_limit());

    match calibrator.run().await {
        Ok(result) => {
            info!(loss = result.loss, termination = ?result.termination, best = %result.best, "calibration result");
            emit(&result, cli.output.as_deref())
        }
        Err(CalibrationError::AllCandidatesInvalid {
            best,
            best_loss,
            rounds,
            failures,
        }) => {
            for failure in &failures {
                error!("{}", failure);
            }
            if let Some(best) = best {
                error!(loss = best_loss, best = %best, "last known best");
            }
            anyhow::bail!("every candidate was invalid for {} consecutive rounds", rounds)
        }
        Err(CalibrationError::NoValidStart { attempts, failures }) => {
            for failure in &failures {
                error!("{}", failure);
            }
            anyhow::bail!("no valid starting point after {} attempts", attempts)
        }
        Err(e) => Err(e.into()),
    }
}
