//! Worker Launchers
//!
//! A session only needs two things from whatever runs the experiment: a way
//! to start it against a named mailbox, and a way to tell whether it is still
//! running. [`ProcessLauncher`] starts a child process; [`ThreadLauncher`]
//! runs the worker on a thread of the current process.

use nperf_ipc::{CAPACITY_ENV, CHANNEL_ENV, MailboxConfig};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest wait between SIGTERM and SIGKILL when tearing down a worker
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Exit check interval during the grace period
const TERMINATE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start worker thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("Cannot locate worker binary: {0}")]
    CurrentExe(#[source] std::io::Error),
}

/// Starts one worker bound to a mailbox.
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker that will open `channel_name` with `config`.
    fn spawn(
        &self,
        channel_name: &str,
        config: &MailboxConfig,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError>;
}

/// Handle to a running worker. Dropping it tears the worker down.
pub trait WorkerProcess: Send {
    /// Whether the worker has finished, for whatever reason
    fn has_exited(&mut self) -> bool;
}

/// Launches a worker binary as a child process.
///
/// The child receives the mailbox as `--nperf-worker <CHANNEL> --capacity
/// <BYTES>` after any configured arguments, and through the
/// `NPERF_CHANNEL` / `NPERF_CHANNEL_CAPACITY` environment variables.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    /// Launch `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Launch the currently running executable in worker mode
    pub fn current_exe() -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self::new(program))
    }

    /// Add an argument passed before the worker arguments
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an extra environment variable for the child
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(
        &self,
        channel_name: &str,
        config: &MailboxConfig,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let capacity = config.capacity.to_string();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--nperf-worker")
            .arg(channel_name)
            .arg("--capacity")
            .arg(&capacity)
            .env(CHANNEL_ENV, channel_name)
            .env(CAPACITY_ENV, &capacity)
            .envs(self.envs.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        tracing::debug!(pid = child.id(), channel = channel_name, "worker process spawned");
        Ok(Box::new(ChildWorker { child }))
    }
}

/// Send SIGTERM to a process. Returns `Err` if the signal could not be delivered.
#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<(), std::io::Error> {
    Ok(())
}

struct ChildWorker {
    child: Child,
}

impl WorkerProcess for ChildWorker {
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

impl ChildWorker {
    /// Poll for exit until `grace` runs out.
    fn exited_within(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.has_exited() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::sleep(remaining.min(TERMINATE_POLL));
        }
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        if !self.has_exited() {
            // Graceful: SIGTERM first, wait for exit, then SIGKILL
            let _ = send_sigterm(self.child.id());
            if !self.exited_within(TERMINATE_GRACE) {
                tracing::debug!(pid = self.child.id(), "worker ignored SIGTERM, killing");
                let _ = self.child.kill();
            }
        }
        let _ = self.child.wait();
    }
}

type WorkerBody = dyn Fn(String, MailboxConfig) + Send + Sync;

/// Runs the worker body on a thread of this process.
///
/// Used by the `thread` isolation mode and by tests. The worker still talks
/// to the session through a real mailbox; only process isolation is lost.
#[derive(Clone)]
pub struct ThreadLauncher {
    body: Arc<WorkerBody>,
}

impl ThreadLauncher {
    /// `body` receives the mailbox name and configuration to connect with.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(String, MailboxConfig) + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
        }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn spawn(
        &self,
        channel_name: &str,
        config: &MailboxConfig,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let body = Arc::clone(&self.body);
        let name = channel_name.to_string();
        let config = config.clone();

        let handle = std::thread::Builder::new()
            .name(format!("nperf-worker-{channel_name}"))
            .spawn(move || body(name, config))
            .map_err(LaunchError::Thread)?;

        Ok(Box::new(WorkerThread { handle }))
    }
}

/// Threads cannot be killed; dropping the handle detaches it.
struct WorkerThread {
    handle: JoinHandle<()>,
}

impl WorkerProcess for WorkerThread {
    fn has_exited(&mut self) -> bool {
        self.handle.is_finished()
    }
}
