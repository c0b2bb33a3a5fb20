//! Lab Service
//!
//! Owns the process-wide [`ConcurrencyGate`] and the settings every session
//! starts with, and runs batches of sessions on a rayon pool.

use nperf_ipc::{ExperimentMessage, Measurement};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

use crate::config::NperfConfig;
use crate::gate::ConcurrencyGate;
use crate::launcher::WorkerLauncher;
use crate::session::{ExperimentSession, SessionConfig, SessionError, SessionState};

#[derive(Debug, Error)]
pub enum LabError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to build session pool: {0}")]
    Pool(String),
}

/// Everything one session produced
#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub channel_name: String,
    /// Successful iterations, in arrival order
    pub results: Vec<(i64, Measurement)>,
    /// Per-iteration errors, in arrival order
    pub errors: Vec<(i64, String)>,
    pub state: SessionState,
    /// Set when the stream failed
    pub failure: Option<Arc<SessionError>>,
}

impl ExperimentOutcome {
    /// Completed with no per-iteration errors
    pub fn is_success(&self) -> bool {
        self.state == SessionState::Completed && self.errors.is_empty()
    }
}

/// Entry point for running experiments.
#[derive(Clone)]
pub struct Lab {
    gate: ConcurrencyGate,
    config: SessionConfig,
    jobs: Option<usize>,
}

impl Lab {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            gate: ConcurrencyGate::new(),
            config,
            jobs: None,
        }
    }

    /// Build a lab from file configuration
    pub fn from_config(config: &NperfConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.session_config()?).with_jobs(config.session.jobs))
    }

    /// Cap the number of sessions [`Lab::run_all`] runs at once
    pub fn with_jobs(mut self, jobs: Option<usize>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create an idle session that shares this lab's gate.
    pub fn session(
        &self,
        launcher: Arc<dyn WorkerLauncher>,
        parallel: bool,
    ) -> Result<ExperimentSession, SessionError> {
        let config = SessionConfig {
            parallel,
            ..self.config.clone()
        };
        ExperimentSession::new(launcher, self.gate.clone(), config)
    }

    /// Subscribe to `session` and block until its stream ends.
    pub fn run_to_completion(&self, session: &ExperimentSession) -> ExperimentOutcome {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut failure = None;

        for event in session.stream() {
            match event {
                Ok(ExperimentMessage::Result { descriptor, value }) => {
                    results.push((descriptor, value))
                }
                Ok(ExperimentMessage::Error { descriptor, message }) => {
                    errors.push((descriptor, message))
                }
                Ok(ExperimentMessage::Completed) => {}
                Err(e) => failure = Some(e),
            }
        }

        let outcome = ExperimentOutcome {
            channel_name: session.channel_name().to_string(),
            results,
            errors,
            state: session.state(),
            failure,
        };
        tracing::debug!(
            session = %outcome.channel_name,
            results = outcome.results.len(),
            errors = outcome.errors.len(),
            state = ?outcome.state,
            "session outcome collected"
        );
        outcome
    }

    /// Run one session per launcher and collect their outcomes, in launcher
    /// order. Non-parallel sessions still take turns on the gate.
    pub fn run_all(
        &self,
        launchers: &[Arc<dyn WorkerLauncher>],
        parallel: bool,
    ) -> Result<Vec<ExperimentOutcome>, LabError> {
        if launchers.is_empty() {
            return Ok(Vec::new());
        }

        let sessions = launchers
            .iter()
            .map(|launcher| self.session(Arc::clone(launcher), parallel))
            .collect::<Result<Vec<_>, _>>()?;

        let worker_count = self.jobs.unwrap_or(0).min(sessions.len());
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("nperf-session-{i}"))
            .build()
            .map_err(|e| LabError::Pool(e.to_string()))?;

        tracing::info!(
            sessions = sessions.len(),
            threads = pool.current_num_threads(),
            parallel,
            "running sessions"
        );

        Ok(pool.install(|| {
            sessions
                .par_iter()
                .map(|session| self.run_to_completion(session))
                .collect()
        }))
    }
}

impl Default for Lab {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
