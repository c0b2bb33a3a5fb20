//! IPC Message Types
//!
//! Everything a worker can put in the mailbox. Serialized with rkyv and
//! validated on the receiving side before use.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Descriptor reserved for the fatal end-of-stream error.
pub const FATAL_DESCRIPTOR: i64 = -1;

/// One measured iteration of an experiment.
///
/// All timing values are in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Measurement {
    /// Name of the test this measurement belongs to
    pub test_name: String,
    /// Wall-clock duration of the iteration
    pub elapsed_nanos: u64,
    /// Number of operations performed during the iteration
    pub operations: u64,
}

impl Measurement {
    /// Create a new measurement
    pub fn new(test_name: impl Into<String>, elapsed_nanos: u64, operations: u64) -> Self {
        Self {
            test_name: test_name.into(),
            elapsed_nanos,
            operations,
        }
    }

    /// Operations per second, or `None` when nothing was timed
    pub fn throughput(&self) -> Option<f64> {
        if self.elapsed_nanos == 0 {
            return None;
        }
        Some(self.operations as f64 * 1e9 / self.elapsed_nanos as f64)
    }
}

/// Messages sent from a worker to the lab.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ExperimentMessage {
    /// A successful iteration
    Result {
        /// Ordinal of the iteration
        descriptor: i64,
        /// What was measured
        value: Measurement,
    },

    /// A failed iteration, or the fatal sentinel when `descriptor == -1`
    Error {
        /// Ordinal of the failed iteration, or [`FATAL_DESCRIPTOR`]
        descriptor: i64,
        /// Human-readable failure description
        message: String,
    },

    /// The worker finished all iterations
    Completed,
}

impl ExperimentMessage {
    /// Build a result message
    pub fn result(descriptor: i64, value: Measurement) -> Self {
        Self::Result { descriptor, value }
    }

    /// Build a per-iteration error message
    pub fn error(descriptor: i64, message: impl Into<String>) -> Self {
        Self::Error {
            descriptor,
            message: message.into(),
        }
    }

    /// Build the fatal sentinel
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::error(FATAL_DESCRIPTOR, message)
    }

    /// Descriptor carried by the message, if any
    pub fn descriptor(&self) -> Option<i64> {
        match self {
            Self::Result { descriptor, .. } | Self::Error { descriptor, .. } => Some(*descriptor),
            Self::Completed => None,
        }
    }

    /// Whether this message ends the stream (`Completed` or the fatal error)
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed => true,
            Self::Error { descriptor, .. } => *descriptor == FATAL_DESCRIPTOR,
            Self::Result { .. } => false,
        }
    }
}
