//! Evaluate one parameter assignment against the reference traces

use anyhow::Result;
use calib::cli::{build_runner, emit, read_assignment, CommonArgs};
use calib::{init_tracing, TrialOutcome};
use clap::Parser;
use platform_params::ParameterAssignment;
use serde::Serialize;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "evaluate", about = "Run one full trial for a parameter assignment and report its loss")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Assignment to evaluate (JSON map of parameter name to value)
    #[arg(long)]
    assignment: PathBuf,

    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct Evaluation {
    assignment: ParameterAssignment,
    #[serde(flatten)]
    outcome: TrialOutcome,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = cli.common.load()?;
    let runner = build_runner(&config, true)?;
    let assignment = runner.space().conform(&read_assignment(&cli.assignment)?)?;

    let outcome = runner.evaluate(&assignment, None).await;
    let invalid = outcome.invalid().cloned();
    emit(&Evaluation { assignment, outcome }, cli.output.as_deref())?;

    if let Some(invalid) = invalid {
        for failure in &invalid.failures {
            error!("{}", failure);
        }
        anyhow::bail!("trial invalid: {:?}", invalid.reason);
    }
    Ok(())
}
