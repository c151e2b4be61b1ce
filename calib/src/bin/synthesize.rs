//! Write simulator traces for a known assignment in the reference layout
//!
//! Calibrating against the result and running `recover` on the outcome
//! checks whether the search finds the parameters it was generated with.

use anyhow::Result;
use calib::cli::{build_runner, read_assignment, CommonArgs};
use calib::init_tracing;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "synthesize", about = "Generate synthetic reference traces from a parameter assignment")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Assignment to simulate (JSON map of parameter name to value)
    #[arg(long)]
    assignment: PathBuf,

    /// Root of the reference tree to write
    #[arg(long)]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = cli.common.load()?;
    config.reference.root = cli.out.clone();
    let layout = config.reference.layout(&config.simulator.workloads);

    let runner = build_runner(&config, false)?;
    let assignment = runner.space().conform(&read_assignment(&cli.assignment)?)?;

    match runner.simulate(&assignment, runner.scenarios(), Some(&layout)).await {
        Ok(set) => {
            info!(groups = set.group_count(), root = %cli.out.display(), "synthetic traces written");
            Ok(())
        }
        Err(invalid) => {
            for failure in &invalid.failures {
                error!("{}", failure);
            }
            anyhow::bail!("simulation failed: {:?}", invalid.reason)
        }
    }
}
