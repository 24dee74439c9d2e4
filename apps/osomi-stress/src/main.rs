//! Osomi stress driver
//!
//! Creates, shares and destroys GPU objects over many frames against the
//! host-memory backend and checks the registry's bookkeeping after each one.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p osomi-stress -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--objects <N>`: Objects created per round (default: 256)
//! - `--rounds <N>`: Number of rounds, one frame each (default: 16)
//! - `--max-id <N>`: Size of the id space (default: 65535)
//! - `--seed <N>`: Seed for the operation mix (default: 42)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod stress;

use tracing_subscriber::EnvFilter;

use crate::stress::{StressParams, StressRun};

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let params = StressParams::from_args();
    tracing::info!(?params, "starting stress run");

    let report = StressRun::new(params)?.run()?;
    tracing::info!(
        created = report.created,
        freed = report.freed,
        shared = report.shared,
        failed = report.failed,
        peak_objects = report.peak_objects,
        peak_reserved = report.peak_reserved,
        "stress run finished"
    );

    Ok(())
}

fn print_help() {
    eprintln!(
        "Osomi registry and GPU memory stress driver

USAGE:
    cargo run -p osomi-stress -- [OPTIONS]

OPTIONS:
    --objects <N>    Objects created per round (default: 256)
    --rounds <N>     Number of rounds, one frame each (default: 16)
    --max-id <N>     Size of the id space (default: 65535)
    --seed <N>       Seed for the operation mix (default: 42)
    -h, --help       Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG         Set log level (e.g., info, debug, trace)"
    );
}
