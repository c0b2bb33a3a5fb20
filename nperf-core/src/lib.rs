#![warn(missing_docs)]
//! NPerf Core - Worker Runtime
//!
//! The worker half of an experiment: attach to the mailbox the lab created,
//! time each iteration, and stream results, per-iteration errors and the
//! final `Completed` (or fatal) message back.

mod worker;

pub use worker::{
    ExperimentWorker, RunSummary, WorkerError, install_sigterm_handler, shutdown_requested,
};

pub use nperf_ipc::{ExperimentMessage, MailboxConfig, Measurement};
