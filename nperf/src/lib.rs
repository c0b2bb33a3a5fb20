#![warn(missing_docs)]
//! # NPerf
//!
//! Out-of-process performance experiments with ordered, replayable result
//! streams.
//!
//! - **Shared-Memory Mailbox**: a single-slot channel over a named shared
//!   memory segment and two named semaphores, carrying rkyv messages
//! - **Sessions**: one worker per session, drained into a log that every
//!   subscriber replays from the start
//! - **Admission Gate**: non-parallel sessions drain one at a time
//! - **Ordered Queue**: many producers, one dispatch thread, acceptance order
//!
//! ## Worker side
//!
//! ```ignore
//! use nperf::prelude::*;
//!
//! let worker = ExperimentWorker::from_env()?;
//! worker.execute("parse", 100, |i| parse_batch(i))?;
//! ```
//!
//! ## Lab side
//!
//! ```ignore
//! use nperf::prelude::*;
//! use std::sync::Arc;
//!
//! let lab = Lab::default();
//! let session = lab.session(Arc::new(ProcessLauncher::new("./parse-worker")), false)?;
//! let outcome = lab.run_to_completion(&session);
//! ```

// Re-export IPC types
pub use nperf_ipc::{
    CAPACITY_ENV, CHANNEL_ENV, ChannelError, DEFAULT_CHANNEL_CAPACITY, DEFAULT_POLL_INTERVAL,
    ExperimentMessage, FATAL_DESCRIPTOR, FrameError, Mailbox, MailboxConfig, MailboxError,
    Measurement,
};

// Re-export worker types
pub use nperf_core::{ExperimentWorker, RunSummary, WorkerError, install_sigterm_handler};

// Re-export lab types
pub use nperf_lab::{
    ConcurrencyGate, ExperimentOutcome, ExperimentSession, GatePermit, IsolationMode, Lab,
    LabError, LaunchError, NperfConfig, OrderedQueue, ProcessLauncher, QueueError, ResultStream,
    SessionConfig, SessionError, SessionEvent, SessionState, StreamEvent, StreamObserver,
    Subscription, ThreadLauncher, WorkerLauncher, WorkerProcess,
};

/// Run the `nperf` command line
pub use nperf_lab::run;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ConcurrencyGate, ExperimentMessage, ExperimentSession, ExperimentWorker, Lab,
        MailboxConfig, Measurement, OrderedQueue, ProcessLauncher, SessionConfig, SessionState,
        StreamEvent, ThreadLauncher, WorkerLauncher,
    };
}
