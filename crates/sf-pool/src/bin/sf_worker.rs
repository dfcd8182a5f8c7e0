//! Worker process for the `spawn` start method.
//!
//! Reads line-delimited JSON requests on stdin and writes replies on stdout.
//! Logs go to stderr so they never corrupt the protocol stream.

use anyhow::Context;
use std::io;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let stdin = io::stdin();
    let stdout = io::stdout();
    sf_pool::serve(stdin.lock(), stdout.lock()).context("sf-worker protocol failure")?;
    Ok(())
}
