#![warn(missing_docs)]
//! NPerf IPC
//!
//! Cross-process plumbing between the lab and its worker processes:
//! a named shared memory slot, a full/empty semaphore handshake guarding it,
//! and the [`Mailbox`] that combines both into a blocking single-item channel
//! carrying rkyv-serialized [`ExperimentMessage`]s.
//!
//! A base name `N` owns three OS resources: the segment `/N` and the
//! semaphores `/N.full` and `/N.empty`. Both ends must agree on `N` and on
//! the channel capacity before attaching.

mod channel;
mod framing;
mod handshake;
mod mailbox;
mod messages;

pub use channel::{ChannelError, MAX_NAME_LEN, SharedChannel, validate_name};
pub use framing::{
    FRAME_HEADER_LEN, FrameError, decode_payload, encode_frame, frame_len, max_payload,
};
pub use handshake::HandshakeLock;
pub use mailbox::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_POLL_INTERVAL, Mailbox, MailboxConfig, MailboxError,
};
pub use messages::{ExperimentMessage, FATAL_DESCRIPTOR, Measurement};

/// Environment variable carrying the mailbox name to a worker
pub const CHANNEL_ENV: &str = "NPERF_CHANNEL";

/// Environment variable carrying the channel capacity to a worker
pub const CAPACITY_ENV: &str = "NPERF_CHANNEL_CAPACITY";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity_fits_typical_messages() {
        let msg = ExperimentMessage::result(0, Measurement::new("a".repeat(256), 1, 1));
        let frame = encode_frame(&msg, DEFAULT_CHANNEL_CAPACITY).unwrap();
        assert!(frame.len() < DEFAULT_CHANNEL_CAPACITY);
    }
}
