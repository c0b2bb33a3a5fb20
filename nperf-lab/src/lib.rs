#![warn(missing_docs)]
//! NPerf Lab
//!
//! The orchestrator side of NPerf: sessions that drain a worker's mailbox
//! into a replayable result stream, the gate that keeps non-parallel
//! sessions from overlapping, an ordered dispatch queue, and the `nperf`
//! command line.
//!
//! # Example
//!
//! ```ignore
//! use nperf_lab::{Lab, ProcessLauncher};
//! use std::sync::Arc;
//!
//! let lab = Lab::default();
//! let session = lab.session(Arc::new(ProcessLauncher::new("my-worker")), false)?;
//! for message in session.stream() {
//!     println!("{:?}", message?);
//! }
//! ```

mod config;
mod gate;
mod lab;
mod launcher;
mod queue;
mod replay;
mod session;

pub use config::*;
pub use gate::{ConcurrencyGate, GatePermit};
pub use lab::{ExperimentOutcome, Lab, LabError};
pub use launcher::{LaunchError, ProcessLauncher, ThreadLauncher, WorkerLauncher, WorkerProcess};
pub use queue::{OrderedQueue, QueueError};
pub use replay::{Cursor, ReplayLog, StreamEvent, Terminal};
pub use session::{
    DEFAULT_CANCEL_GRACE, ExperimentSession, ResultStream, SessionConfig, SessionError,
    SessionEvent, SessionState, StreamObserver, Subscription,
};

use clap::{Parser, Subcommand};
use nperf_core::{ExperimentWorker, install_sigterm_handler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// NPerf CLI arguments
#[derive(Parser, Debug)]
#[command(name = "nperf")]
#[command(author, version, about = "NPerf - out-of-process performance experiments")]
pub struct Cli {
    /// Optional subcommand (Run, Config); defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (default: nperf.toml discovered upwards)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Internal: Run as worker process on this mailbox (used by the lab)
    #[arg(long, hide = true, value_name = "CHANNEL")]
    pub nperf_worker: Option<String>,

    /// Internal: Mailbox capacity agreed with the lab
    #[arg(long, hide = true)]
    pub capacity: Option<usize>,

    /// Internal: Iterations a worker runs
    #[arg(long, hide = true, default_value = "10")]
    pub worker_iterations: u64,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run demo experiments through the lab (default)
    Run(RunArgs),
    /// Print a default nperf.toml
    Config,
}

/// Options for `nperf run`
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Number of experiments
    #[arg(long, short = 'n', default_value = "4")]
    pub experiments: usize,

    /// Iterations per experiment
    #[arg(long, short = 'i', default_value = "10")]
    pub iterations: u64,

    /// Let sessions drain concurrently instead of one at a time
    #[arg(long)]
    pub parallel: bool,

    /// Sessions run at once
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,

    /// Where workers run
    #[arg(long, value_enum)]
    pub isolation: Option<IsolationMode>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            experiments: 4,
            iterations: 10,
            parallel: false,
            jobs: None,
            isolation: None,
        }
    }
}

/// Run the NPerf CLI with the process arguments.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the NPerf CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    // Handle worker mode first (before any other initialization)
    if let Some(channel) = &cli.nperf_worker {
        let config = load_config(cli.config.as_ref())?;
        return run_worker_mode(channel, cli.capacity, cli.worker_iterations, &config);
    }

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("nperf=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("nperf=info")
            .init();
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Some(Commands::Config) => {
            print!("{}", NperfConfig::default_toml());
            Ok(())
        }
        Some(Commands::Run(args)) => run_experiments(&args, &config, cli.config.as_ref()),
        None => run_experiments(&RunArgs::default(), &config, cli.config.as_ref()),
    }
}

/// Explicit path wins, otherwise discover, otherwise defaults
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NperfConfig> {
    match path {
        Some(path) => NperfConfig::load(path),
        None => Ok(NperfConfig::discover().unwrap_or_default()),
    }
}

fn run_worker_mode(
    channel: &str,
    capacity: Option<usize>,
    iterations: u64,
    config: &NperfConfig,
) -> anyhow::Result<()> {
    install_sigterm_handler();

    let mut mailbox = config.mailbox()?;
    if let Some(capacity) = capacity {
        mailbox.capacity = capacity;
    }

    let worker = ExperimentWorker::connect(channel, &mailbox)
        .map_err(|e| anyhow::anyhow!("Worker error: {}", e))?
        .with_send_timeout(config.send_timeout()?);
    worker
        .execute("demo", iterations, demo_workload)
        .map_err(|e| anyhow::anyhow!("Worker error: {}", e))?;
    Ok(())
}

/// Sum of squares over a slice that grows with the iteration index.
/// Returns the number of elements processed.
pub fn demo_workload(iteration: u64) -> u64 {
    let len = 10_000 + iteration * 1_000;
    let sum = (0..len).fold(0u64, |acc, x| acc.wrapping_add(x.wrapping_mul(x)));
    std::hint::black_box(sum);
    len
}

fn run_experiments(
    args: &RunArgs,
    config: &NperfConfig,
    config_path: Option<&PathBuf>,
) -> anyhow::Result<()> {
    let jobs = args.jobs.or(config.session.jobs);
    let parallel = args.parallel || config.session.parallel;
    let isolation = args.isolation.unwrap_or(config.session.isolation);
    let send_timeout = config.send_timeout()?;

    let lab = Lab::from_config(config)?.with_jobs(jobs);
    let launcher: Arc<dyn WorkerLauncher> = match isolation {
        IsolationMode::Process => {
            let mut launcher = ProcessLauncher::current_exe()?
                .arg("--worker-iterations")
                .arg(args.iterations.to_string());
            // Workers read the same file for poll interval and send timeout
            if let Some(path) = config_path {
                launcher = launcher.arg("--config").arg(path);
            }
            Arc::new(launcher)
        }
        IsolationMode::Thread => {
            let iterations = args.iterations;
            Arc::new(ThreadLauncher::new(move |name, mailbox| {
                let outcome = ExperimentWorker::connect(&name, &mailbox).and_then(|worker| {
                    worker
                        .with_send_timeout(send_timeout)
                        .execute("demo", iterations, demo_workload)
                });
                if let Err(e) = outcome {
                    tracing::warn!(channel = %name, error = %e, "worker thread failed");
                }
            }))
        }
    };

    tracing::info!(
        experiments = args.experiments,
        iterations = args.iterations,
        ?isolation,
        parallel,
        "starting experiments"
    );

    let launchers = vec![launcher; args.experiments];
    let outcomes = lab.run_all(&launchers, parallel)?;

    let mut failed = 0;
    for outcome in &outcomes {
        println!("{}", format_outcome(outcome));
        if !outcome.is_success() {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} experiments did not succeed", failed, outcomes.len());
    }
    Ok(())
}

fn format_outcome(outcome: &ExperimentOutcome) -> String {
    let total_nanos: u64 = outcome.results.iter().map(|(_, m)| m.elapsed_nanos).sum();
    let total_ops: u64 = outcome.results.iter().map(|(_, m)| m.operations).sum();
    let per_op = if total_ops > 0 {
        Duration::from_nanos(total_nanos / total_ops)
    } else {
        Duration::ZERO
    };
    let ops_per_sec = nperf_ipc::Measurement::new("total", total_nanos, total_ops)
        .throughput()
        .unwrap_or(0.0);

    let mut line = format!(
        "{:<24} {:<10} {:>4} results {:>3} errors  {:>10}/op {:>14.0} ops/s",
        outcome.channel_name,
        format!("{:?}", outcome.state),
        outcome.results.len(),
        outcome.errors.len(),
        format!("{:?}", per_op),
        ops_per_sec,
    );
    if let Some(failure) = &outcome.failure {
        line.push_str(&format!("  ({failure})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from([
            "nperf",
            "run",
            "--experiments",
            "3",
            "--parallel",
            "--isolation",
            "thread",
            "-j",
            "2",
        ]);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.experiments, 3);
                assert!(args.parallel);
                assert_eq!(args.isolation, Some(IsolationMode::Thread));
                assert_eq!(args.jobs, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_worker_mode() {
        let cli = Cli::parse_from([
            "nperf",
            "--worker-iterations",
            "5",
            "--nperf-worker",
            "nperf-1-0",
            "--capacity",
            "4096",
        ]);
        assert_eq!(cli.nperf_worker.as_deref(), Some("nperf-1-0"));
        assert_eq!(cli.capacity, Some(4096));
        assert_eq!(cli.worker_iterations, 5);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_demo_workload_counts_elements() {
        assert_eq!(demo_workload(0), 10_000);
        assert_eq!(demo_workload(3), 13_000);
    }

    #[test]
    fn test_format_outcome() {
        let outcome = ExperimentOutcome {
            channel_name: "nperf-1-0".to_string(),
            results: vec![(0, nperf_ipc::Measurement::new("demo", 2_000, 1_000))],
            errors: Vec::new(),
            state: SessionState::Completed,
            failure: None,
        };
        let line = format_outcome(&outcome);
        assert!(line.starts_with("nperf-1-0"));
        assert!(line.contains("Completed"));
        assert!(line.contains("1 results"));
        assert!(line.contains("500000000 ops/s"));
    }
}
