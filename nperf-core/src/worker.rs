//! Worker Process Side
//!
//! Connects to the mailbox the lab created for this worker and streams one
//! message per iteration back to it.
//!
//! On Unix a SIGTERM handler is installed so a worker asked to stop by the
//! lab finishes the current iteration and reports a fatal end instead of
//! dying mid-send.

use nperf_ipc::{
    CAPACITY_ENV, CHANNEL_ENV, ExperimentMessage, Mailbox, MailboxConfig, MailboxError,
    Measurement,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Global flag set by SIGTERM handler to request graceful shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if a graceful shutdown has been requested via SIGTERM.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Install a SIGTERM handler that sets the `SHUTDOWN_REQUESTED` flag.
/// The handler is async-signal-safe (only sets an atomic).
#[cfg(unix)]
pub fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// No-op on non-Unix (no SIGTERM equivalent).
#[cfg(not(unix))]
pub fn install_sigterm_handler() {}

/// Errors raised on the worker side
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Tally of one [`ExperimentWorker::run`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations reported as results
    pub succeeded: u64,
    /// Iterations reported as per-iteration errors
    pub failed: u64,
    /// Whether the run stopped early because of SIGTERM
    pub interrupted: bool,
}

/// The sending end of one experiment's mailbox.
pub struct ExperimentWorker {
    mailbox: Mailbox,
    send_timeout: Option<Duration>,
}

impl ExperimentWorker {
    /// Attach to the mailbox `channel_name`.
    pub fn connect(channel_name: &str, config: &MailboxConfig) -> Result<Self, WorkerError> {
        Ok(Self {
            mailbox: Mailbox::open(channel_name, config)?,
            send_timeout: None,
        })
    }

    /// Attach using `NPERF_CHANNEL` and `NPERF_CHANNEL_CAPACITY`.
    pub fn from_env() -> Result<Self, WorkerError> {
        let name = std::env::var(CHANNEL_ENV).map_err(|_| WorkerError::MissingEnv(CHANNEL_ENV))?;

        let mut config = MailboxConfig::default();
        if let Ok(value) = std::env::var(CAPACITY_ENV) {
            config.capacity = value.parse().map_err(|_| WorkerError::InvalidEnv {
                var: CAPACITY_ENV,
                value,
            })?;
        }

        Self::connect(&name, &config)
    }

    /// Give up on a send if the lab does not free the slot within `timeout`.
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Mailbox name this worker writes to
    pub fn channel_name(&self) -> &str {
        self.mailbox.name()
    }

    /// Send a message as-is
    pub fn send(&self, message: &ExperimentMessage) -> Result<(), WorkerError> {
        self.mailbox.send(message, self.send_timeout)?;
        Ok(())
    }

    /// Report a successful iteration
    pub fn report(&self, descriptor: i64, value: Measurement) -> Result<(), WorkerError> {
        self.send(&ExperimentMessage::result(descriptor, value))
    }

    /// Report a failed iteration; the stream carries on
    pub fn report_error(
        &self,
        descriptor: i64,
        message: impl Into<String>,
    ) -> Result<(), WorkerError> {
        self.send(&ExperimentMessage::error(descriptor, message))
    }

    /// Signal that every iteration has been reported
    pub fn complete(self) -> Result<(), WorkerError> {
        self.send(&ExperimentMessage::Completed)
    }

    /// End the stream with the fatal sentinel
    pub fn fail(self, message: impl Into<String>) -> Result<(), WorkerError> {
        self.send(&ExperimentMessage::fatal(message))
    }

    /// Time `iterations` calls of `body`, reporting each one.
    ///
    /// `body` receives the iteration index and returns how many operations it
    /// performed. A panicking iteration is reported as an error with that
    /// iteration's descriptor and the run continues.
    pub fn run<F>(
        &self,
        test_name: &str,
        iterations: u64,
        mut body: F,
    ) -> Result<RunSummary, WorkerError>
    where
        F: FnMut(u64) -> u64,
    {
        let mut summary = RunSummary::default();

        for iteration in 0..iterations {
            if shutdown_requested() {
                summary.interrupted = true;
                break;
            }

            let start = Instant::now();
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(iteration)));
            let elapsed = start.elapsed();

            let descriptor = iteration as i64;
            match outcome {
                Ok(operations) => {
                    let value =
                        Measurement::new(test_name, elapsed.as_nanos() as u64, operations);
                    self.report(descriptor, value)?;
                    summary.succeeded += 1;
                }
                Err(panic) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    tracing::debug!(test = test_name, iteration, %message, "iteration panicked");
                    self.report_error(descriptor, message)?;
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Run `body` and close the stream: `Completed` normally, the fatal
    /// sentinel if the run was interrupted by SIGTERM.
    pub fn execute<F>(
        self,
        test_name: &str,
        iterations: u64,
        body: F,
    ) -> Result<RunSummary, WorkerError>
    where
        F: FnMut(u64) -> u64,
    {
        let summary = self.run(test_name, iterations, body)?;
        if summary.interrupted {
            self.fail("worker terminated before finishing")?;
        } else {
            self.complete()?;
        }
        Ok(summary)
    }
}
