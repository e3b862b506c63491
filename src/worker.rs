//! Entry point of the worker processes spawned by the engine
//!
//! A worker reads one task per line from stdin and answers on stdout, so nothing else may
//! write to stdout. Logging goes to stderr.

use ffp_core::errors::FfpResult;
use ffp_core::protocol::TaskHandler;
use ffp_model::FfpClimatology;
use log::debug;
use std::io;

/// Serve tasks on the standard streams until stdin is closed
pub fn serve_stdio() -> FfpResult<()> {
    debug!("Worker {} ready", std::process::id());
    let stdin = io::stdin();
    let stdout = io::stdout();
    TaskHandler::new(FfpClimatology::default()).serve(stdin.lock(), stdout.lock())
}
