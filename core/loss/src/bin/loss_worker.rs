//! One-shot loss worker
//!
//! Reads a request frame on stdin, writes one response frame on stdout.
//! A frame that cannot be read exits non-zero without writing anything.

use std::io::{self, Write};
use std::process::ExitCode;
use trace_loss::{Frame, FrameKind, LossRequest};
use tracing::{debug, error};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let frame = match Frame::read_from(io::stdin().lock()) {
        Ok(frame) if frame.kind == FrameKind::Request => frame,
        Ok(frame) => {
            error!(kind = ?frame.kind, "expected a request frame");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "bad request frame");
            return ExitCode::FAILURE;
        }
    };

    let response = match frame.decode::<LossRequest>() {
        Ok(request) => {
            let report = request.evaluate();
            debug!(metric = %request.metric, loss = report.loss(), "evaluated");
            Frame::encode(FrameKind::Response, &report)
        }
        Err(e) => Frame::encode(FrameKind::Failure, &e.to_string()),
    };

    let bytes = match response {
        Ok(frame) => frame.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to encode response");
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(&bytes).and_then(|_| stdout.flush()) {
        error!(error = %e, "failed to write response");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
