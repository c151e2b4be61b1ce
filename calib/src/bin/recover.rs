//! Compare a calibrated assignment with the one synthetic traces came from

use anyhow::Result;
use calib::cli::{emit, read_calibrated, CommonArgs};
use calib::init_tracing;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "recover", about = "Report the relative error between calibrated and true parameters")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Calibration result or assignment JSON
    #[arg(long)]
    calibrated: PathBuf,

    /// Assignment the synthetic traces were generated with
    #[arg(long)]
    truth: PathBuf,

    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = cli.common.load()?;
    let space = config.space()?;
    let calibrated = read_calibrated(&cli.calibrated)?;
    let truth = read_calibrated(&cli.truth)?;

    let error = space.recovery_error(&calibrated, &truth);
    info!(total = error.total, "recovery error");
    emit(&error, cli.output.as_deref())
}
