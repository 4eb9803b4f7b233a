use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use memo_cache::config::Config;
use memo_cache::logging::ensure_log_error;

use crate::stresstest::perform_stresstest;
use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration, default_value = "10s")]
    duration: Duration,

    /// Print logs as configured, instead of discarding them.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to an in-process statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run(Cli::parse()) {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    workloads.validate()?;

    let config = Config::get(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let _guard = runtime.enter();
    let mut logging_guard = logging::init(
        logging::Config {
            tracing: cli.tracing,
            metrics: cli.metrics,
        },
        &config.logging,
    )?;

    if let Some(udp_sink) = logging_guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    } else {
        memo_cache::metrics::configure(&config.metrics)?;
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
