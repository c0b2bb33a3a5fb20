//! Experiment Session
//!
//! One session owns one mailbox and, once started, one worker. A dedicated
//! drainer thread moves messages out of the mailbox into a [`ReplayLog`]
//! until the worker signals the end of the stream or goes away. Observers
//! read from the log, so a late subscriber sees exactly what an early one
//! saw.
//!
//! The first subscription starts the session. For a non-parallel session it
//! first waits on the lab's [`ConcurrencyGate`]; the permit is held by that
//! subscription and released when it is dropped, whether or not the stream
//! has ended by then.

use nperf_ipc::{ExperimentMessage, FATAL_DESCRIPTOR, Mailbox, MailboxConfig, MailboxError};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::gate::{ConcurrencyGate, GatePermit};
use crate::launcher::{LaunchError, WorkerLauncher, WorkerProcess};
use crate::replay::{Cursor, ReplayLog, StreamEvent, Terminal};

/// Default time a dropped subscription waits for the drainer to stop
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Failed to launch worker: {0}")]
    Launch(#[from] LaunchError),

    #[error("No message from a live worker within {0:?}")]
    ReceiveDeadline(Duration),

    #[error("Drainer panicked: {0}")]
    DrainerPanicked(String),

    #[error("Failed to start session thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nobody subscribed yet
    Idle,
    /// Worker launched, drainer running
    Running,
    /// Stream ended with `Completed`, the fatal sentinel or worker exit
    Completed,
    /// Stream ended with an error
    Failed,
    /// The owning subscription was dropped before the stream ended
    Cancelled,
}

impl SessionState {
    /// Whether the session reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What subscribers see
pub type SessionEvent = StreamEvent<ExperimentMessage, Arc<SessionError>>;

type SessionLog = ReplayLog<ExperimentMessage, Arc<SessionError>>;

/// Per-session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Mailbox shared with the worker
    pub mailbox: MailboxConfig,
    /// Skip the concurrency gate
    pub parallel: bool,
    /// Fail if a live worker stays silent for this long (`None` = never)
    pub receive_timeout: Option<Duration>,
    /// How long a dropped owning subscription waits for the drainer
    pub cancel_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            parallel: false,
            receive_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

struct Shared {
    channel_name: String,
    config: SessionConfig,
    launcher: Arc<dyn WorkerLauncher>,
    gate: ConcurrencyGate,
    /// Present until the session starts
    mailbox: Mutex<Option<Mailbox>>,
    state: Mutex<SessionState>,
    log: Arc<SessionLog>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state() = state;
    }

    /// Publish the terminal signal. The state is updated first so anyone
    /// woken by the signal reads the final state.
    fn finish(&self, state: SessionState, terminal: Terminal<Arc<SessionError>>) {
        self.set_state(state);
        self.log.finish(terminal);
    }
}

/// A worker run exposed as an ordered, replayable message stream.
pub struct ExperimentSession {
    shared: Arc<Shared>,
}

impl ExperimentSession {
    /// Create an idle session and its mailbox. Nothing runs until the first
    /// subscription.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        gate: ConcurrencyGate,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let channel_name = format!(
            "nperf-{}-{}",
            std::process::id(),
            NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
        );
        let mailbox = Mailbox::open(&channel_name, &config.mailbox)?;

        Ok(Self {
            shared: Arc::new(Shared {
                channel_name,
                config,
                launcher,
                gate,
                mailbox: Mutex::new(Some(mailbox)),
                state: Mutex::new(SessionState::Idle),
                log: Arc::new(SessionLog::new()),
            }),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state()
    }

    /// Mailbox name handed to the worker
    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }

    /// Whether this session bypasses the concurrency gate
    pub fn is_parallel(&self) -> bool {
        self.shared.config.parallel
    }

    /// Pull-style subscription. Starts the session if it is idle.
    ///
    /// Blocks while a non-parallel session waits for the gate.
    pub fn stream(&self) -> ResultStream {
        let owner = self.start_if_idle();
        ResultStream {
            cursor: self.shared.log.cursor(),
            owner,
        }
    }

    /// Push-style subscription: `observer` is called from a delivery thread,
    /// in order, until the stream ends or the subscription is dropped.
    pub fn subscribe<O>(&self, mut observer: O) -> Result<Subscription, SessionError>
    where
        O: StreamObserver,
    {
        let ResultStream { mut cursor, owner } = self.stream();
        let stop = Arc::new(AtomicBool::new(false));
        let poll = self.shared.config.mailbox.poll_interval;

        let delivery = std::thread::Builder::new()
            .name(format!("nperf-deliver-{}", self.shared.channel_name))
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    while !stop.load(Ordering::Acquire) {
                        match cursor.next_event(Some(poll)) {
                            Some(StreamEvent::Item(message)) => observer.on_next(message),
                            Some(StreamEvent::Completed) => return observer.on_completed(),
                            Some(StreamEvent::Failed(error)) => return observer.on_error(error),
                            None => {}
                        }
                    }
                }
            })
            .map_err(SessionError::Spawn)?;

        Ok(Subscription {
            stop,
            delivery: Some(delivery),
            owner,
        })
    }

    fn start_if_idle(&self) -> Option<OwnerGuard> {
        let mailbox = self
            .shared
            .mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let name = &self.shared.channel_name;
        let permit = if self.shared.config.parallel {
            None
        } else {
            Some(self.shared.gate.acquire())
        };

        self.shared.set_state(SessionState::Running);
        tracing::info!(session = %name, parallel = self.shared.config.parallel, "session started");

        let process = match self.shared.launcher.spawn(name, &self.shared.config.mailbox) {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "worker launch failed");
                drop(mailbox);
                let error = Arc::new(SessionError::from(e));
                self.shared.finish(SessionState::Failed, Terminal::Failed(error));
                return None;
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        // If the spawn fails the closure is dropped unrun, which tears down
        // the worker.
        let drainer = Drainer {
            shared: Arc::clone(&self.shared),
            mailbox,
            process,
            cancel: Arc::clone(&cancel),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("nperf-drain-{name}"))
            .spawn(move || {
                drainer.run();
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => Some(OwnerGuard {
                channel_name: name.clone(),
                cancel,
                done: done_rx,
                drainer: Some(handle),
                grace: self.shared.config.cancel_grace,
                permit,
            }),
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "failed to start drainer");
                let _ = Mailbox::remove(name);
                let error = Arc::new(SessionError::Spawn(e));
                self.shared.finish(SessionState::Failed, Terminal::Failed(error));
                None
            }
        }
    }
}

/// Receives a session's events on the delivery thread.
pub trait StreamObserver: Send + 'static {
    /// Next message, in arrival order
    fn on_next(&mut self, message: ExperimentMessage);
    /// The stream failed; nothing follows
    fn on_error(&mut self, error: Arc<SessionError>);
    /// The stream ended normally; nothing follows
    fn on_completed(&mut self);
}

impl StreamObserver for mpsc::Sender<SessionEvent> {
    fn on_next(&mut self, message: ExperimentMessage) {
        let _ = self.send(StreamEvent::Item(message));
    }

    fn on_error(&mut self, error: Arc<SessionError>) {
        let _ = self.send(StreamEvent::Failed(error));
    }

    fn on_completed(&mut self) {
        let _ = self.send(StreamEvent::Completed);
    }
}

/// Blocking iterator over a session's stream.
///
/// Yields `Ok` per message, one `Err` if the stream failed, then `None`.
/// Dropping the stream that started the session cancels it.
pub struct ResultStream {
    cursor: Cursor<ExperimentMessage, Arc<SessionError>>,
    owner: Option<OwnerGuard>,
}

impl ResultStream {
    /// Next raw event, waiting at most `timeout`. `None` on timeout or after
    /// the terminal event.
    pub fn next_event(&mut self, timeout: Option<Duration>) -> Option<SessionEvent> {
        self.cursor.next_event(timeout)
    }

    /// Whether this stream started the session and can cancel it
    pub fn is_owner(&self) -> bool {
        self.owner.is_some()
    }
}

impl Iterator for ResultStream {
    type Item = Result<ExperimentMessage, Arc<SessionError>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.next_event(None)? {
            StreamEvent::Item(message) => Some(Ok(message)),
            StreamEvent::Failed(error) => Some(Err(error)),
            StreamEvent::Completed => None,
        }
    }
}

/// Handle for a push subscription. Dropping it stops delivery.
pub struct Subscription {
    stop: Arc<AtomicBool>,
    delivery: Option<JoinHandle<()>>,
    owner: Option<OwnerGuard>,
}

impl Subscription {
    /// Block until the observer has received the terminal event.
    pub fn wait(mut self) {
        if let Some(handle) = self.delivery.take() {
            let _ = handle.join();
        }
    }

    /// Whether this subscription started the session and can cancel it
    pub fn is_owner(&self) -> bool {
        self.owner.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.delivery.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Cancellation authority held by the subscription that started the session.
///
/// Owns the gate permit of a non-parallel session. The permit is released
/// only after the drainer has been joined or the grace period has run out.
struct OwnerGuard {
    channel_name: String,
    cancel: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    drainer: Option<JoinHandle<()>>,
    grace: Duration,
    permit: Option<GatePermit>,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.stop_drainer();
        drop(self.permit.take());
    }
}

impl OwnerGuard {
    fn stop_drainer(&mut self) {
        let Some(handle) = self.drainer.take() else {
            return;
        };

        match self.done.recv_timeout(self.grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    session = %self.channel_name,
                    grace = ?self.grace,
                    "drainer did not stop in time, detaching"
                );
            }
        }
    }
}

/// How draining ended without an error
enum DrainEnd {
    Completed,
    Fatal(String),
    Exited,
    Cancelled,
}

struct Drainer {
    shared: Arc<Shared>,
    mailbox: Mailbox,
    process: Box<dyn WorkerProcess>,
    cancel: Arc<AtomicBool>,
}

impl Drainer {
    fn run(self) {
        let Self {
            shared,
            mailbox,
            mut process,
            cancel,
        } = self;
        let name = &shared.channel_name;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            drain(&shared, &mailbox, process.as_mut(), &cancel)
        }));

        // The worker goes first; a killed worker never detaches, so the
        // names are removed explicitly once it is gone.
        drop(process);
        mailbox.close();
        drop(mailbox);
        if let Err(e) = Mailbox::remove(name) {
            tracing::debug!(session = %name, error = %e, "failed to remove mailbox");
        }

        match outcome {
            Ok(Ok(DrainEnd::Cancelled)) => {
                tracing::info!(session = %name, "session cancelled");
                shared.finish(SessionState::Cancelled, Terminal::Completed);
            }
            Ok(Ok(end)) => {
                match &end {
                    DrainEnd::Fatal(message) => {
                        tracing::info!(
                            session = %name,
                            %message,
                            "worker ended with fatal sentinel"
                        )
                    }
                    DrainEnd::Exited => tracing::info!(session = %name, "worker exited"),
                    _ => tracing::info!(session = %name, "session completed"),
                }
                shared.finish(SessionState::Completed, Terminal::Completed);
            }
            Ok(Err(e)) => {
                tracing::warn!(session = %name, error = %e, "session failed");
                shared.finish(SessionState::Failed, Terminal::Failed(Arc::new(e)));
            }
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!(session = %name, %message, "drainer panicked");
                shared.finish(
                    SessionState::Failed,
                    Terminal::Failed(Arc::new(SessionError::DrainerPanicked(message))),
                );
            }
        }
    }
}

/// Move messages from the mailbox into the log until a terminal condition.
fn drain(
    shared: &Shared,
    mailbox: &Mailbox,
    process: &mut dyn WorkerProcess,
    cancel: &AtomicBool,
) -> Result<DrainEnd, SessionError> {
    let poll = shared.config.mailbox.poll_interval;
    let mut last_message = Instant::now();

    loop {
        if cancel.load(Ordering::Acquire) {
            return Ok(DrainEnd::Cancelled);
        }

        match mailbox.receive::<ExperimentMessage>(Some(poll)) {
            Ok(message) => {
                last_message = Instant::now();
                if let Some(end) = accept(&shared.log, message) {
                    return Ok(end);
                }
                if process.has_exited() {
                    return drain_after_exit(&shared.log, mailbox);
                }
            }
            Err(MailboxError::Timeout(_)) => {
                if process.has_exited() {
                    return drain_after_exit(&shared.log, mailbox);
                }
                if let Some(limit) = shared.config.receive_timeout {
                    if last_message.elapsed() >= limit {
                        return Err(SessionError::ReceiveDeadline(limit));
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A worker that has exited can have left at most one message in the slot.
fn drain_after_exit(log: &SessionLog, mailbox: &Mailbox) -> Result<DrainEnd, SessionError> {
    match mailbox.receive::<ExperimentMessage>(Some(Duration::ZERO)) {
        Ok(message) => Ok(accept(log, message).unwrap_or(DrainEnd::Exited)),
        Err(MailboxError::Timeout(_)) => Ok(DrainEnd::Exited),
        Err(e) => Err(e.into()),
    }
}

/// Publish a stream item, or report the end the message signals.
fn accept(log: &SessionLog, message: ExperimentMessage) -> Option<DrainEnd> {
    match message {
        ExperimentMessage::Completed => Some(DrainEnd::Completed),
        ExperimentMessage::Error {
            descriptor: FATAL_DESCRIPTOR,
            message,
        } => Some(DrainEnd::Fatal(message)),
        item => {
            log.publish(item);
            None
        }
    }
}
