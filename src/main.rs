//! # seqtest - Main Entry Point
//!
//! ## Architecture Overview
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: Processes command-line configuration
//! 2. **Initialize logging**: Colorized console output, optional log file
//! 3. **Build the run configuration**: Resolves addresses, normalizes ranges
//! 4. **Run**: The blocking orchestrator runs on a dedicated thread while the
//!    async side waits for it or for Ctrl-C
//! 5. **Report**: Prints the summary and writes the optional JSON report and
//!    sample dump
//!
//! ## Error Handling
//!
//! Setup failures (bad arguments, unresolvable hosts, refused connections)
//! end the process with an error. Failed workers do not: their status is in
//! the report, and the exit code is non-zero when any worker failed.
//!
//! ## Cancellation
//!
//! Ctrl-C trips the shared cancel token. Workers stop at their next blocking
//! boundary and the partial results are still reported. A second Ctrl-C is
//! not intercepted.

use anyhow::{Context, Result};
use clap::Parser;
use seqtest::{
    cli::Args,
    config::TestConfig,
    coordination::CancelToken,
    logging::init_logging,
    results::{write_sample_dump, RunReport},
    runner::{RunOutcome, TestRunner},
    utils::validate_cpu_cores,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_guard = init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting seqtest {}", seqtest::VERSION);
    let config = TestConfig::from_args(&args)?;
    validate_cpu_cores(&config.cpu_affinity)?;

    let cancel = CancelToken::new();
    let runner = TestRunner::new(config.clone()).with_cancel(cancel.clone());
    let run = tokio::task::spawn_blocking(move || runner.run());
    tokio::pin!(run);

    let outcome = tokio::select! {
        joined = &mut run => joined,
        _ = ctrl_c() => {
            warn!("Interrupted, stopping workers");
            cancel.cancel();
            run.await
        }
    }
    .context("Orchestrator thread panicked")??;

    report(&config, &outcome)?;

    if outcome.failures() > 0 {
        error!("{} workers failed", outcome.failures());
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves,
/// so the run simply goes to completion.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn report(config: &TestConfig, outcome: &RunOutcome) -> Result<()> {
    let report = RunReport::from_outcome(config, outcome);
    println!("{}", report);

    if let Some(path) = &config.dump_file {
        write_sample_dump(path, outcome)?;
    }
    if let Some(path) = &config.output_file {
        report.write_json(path)?;
    }
    Ok(())
}
