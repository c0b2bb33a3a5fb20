//! Inter-Process Mailbox
//!
//! A blocking single-item container shared by exactly two processes: one
//! sends, the other receives. The slot lives in a [`SharedChannel`] and is
//! guarded by a [`HandshakeLock`].
//!
//! Blocking calls never sleep on the OS primitive for longer than the
//! configured poll interval, so [`Mailbox::close`] is observed promptly even
//! by a caller that asked to wait forever.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::channel::{ChannelError, SharedChannel};
use crate::framing::{FRAME_HEADER_LEN, FrameError, decode_payload, encode_frame, frame_len};
use crate::handshake::HandshakeLock;

/// Default slot size (64KB)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64 * 1024;

/// Default upper bound on a single wait on the OS semaphore
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors returned by mailbox operations
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Mailbox operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Mailbox closed")]
    Closed,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Settings both ends of a mailbox must agree on (capacity) or may tune
/// locally (poll interval).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Slot size in bytes, including the 4-byte length prefix
    pub capacity: usize,
    /// Longest single wait before re-checking for closure or deadline
    pub poll_interval: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Blocking single-slot channel between two processes.
pub struct Mailbox {
    name: String,
    capacity: usize,
    poll_interval: Duration,
    channel: Mutex<Option<SharedChannel>>,
    lock: HandshakeLock,
    closed: AtomicBool,
}

impl Mailbox {
    /// Open the mailbox called `name`, creating its resources if needed.
    pub fn open(name: &str, config: &MailboxConfig) -> Result<Self, MailboxError> {
        let channel = SharedChannel::open(name, config.capacity)?;

        // Semaphores left over from a crashed run would carry a stale count.
        if channel.is_creator() {
            HandshakeLock::remove(name)?;
        }
        let lock = HandshakeLock::open(name)?;

        tracing::debug!(mailbox = name, capacity = config.capacity, "mailbox opened");

        Ok(Self {
            name: name.to_string(),
            capacity: config.capacity,
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
            channel: Mutex::new(Some(channel)),
            lock,
            closed: AtomicBool::new(false),
        })
    }

    /// Unlink every OS name behind the mailbox `name`.
    ///
    /// Handles that are still open keep working. Used by the side that
    /// created the mailbox once its peer is gone, since a killed peer never
    /// detaches. The last of the old handles to close unlinks `name` again,
    /// so the name must not be reused while they are open.
    pub fn remove(name: &str) -> Result<(), MailboxError> {
        SharedChannel::remove(name)?;
        HandshakeLock::remove(name)?;
        Ok(())
    }

    /// Name shared with the peer process
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether [`Mailbox::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Put a message in the slot, waiting for it to be free.
    ///
    /// `None` waits until the peer frees the slot or the mailbox is closed.
    pub fn send<T>(&self, message: &T, timeout: Option<Duration>) -> Result<(), MailboxError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        // Serialize before touching the slot so an oversized message leaves it free.
        let frame = encode_frame(message, self.capacity)?;

        self.wait(timeout, |slice| self.lock.acquire_empty(Some(slice)))?;

        let written = self
            .channel()
            .as_mut()
            .ok_or(MailboxError::Closed)
            .and_then(|channel| channel.write(0, &frame).map_err(MailboxError::from));

        if let Err(e) = written {
            let _ = self.lock.signal_empty();
            return Err(e);
        }

        self.lock.signal_full()?;
        Ok(())
    }

    /// Take the message out of the slot, waiting for one to arrive.
    ///
    /// The slot is handed back to the sender even if the payload fails to decode.
    pub fn receive<T>(&self, timeout: Option<Duration>) -> Result<T, MailboxError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        self.wait(timeout, |slice| self.lock.acquire_full(Some(slice)))?;

        let payload = self.read_slot();
        self.lock.signal_empty()?;

        Ok(decode_payload(&payload?)?)
    }

    /// Mark the mailbox closed. Blocked and future calls fail with
    /// [`MailboxError::Closed`]; OS resources are released on drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(mailbox = %self.name, "mailbox closed");
        }
    }

    fn channel(&self) -> MutexGuard<'_, Option<SharedChannel>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slot(&self) -> Result<AlignedVec, MailboxError> {
        let guard = self.channel();
        let channel = guard.as_ref().ok_or(MailboxError::Closed)?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        channel.read(0, &mut header)?;
        let len = frame_len(header, self.capacity)?;

        let mut payload = AlignedVec::with_capacity(len);
        payload.resize(len, 0);
        channel.read(FRAME_HEADER_LEN, &mut payload)?;
        Ok(payload)
    }

    /// Run `attempt` in poll-interval slices until it succeeds, the deadline
    /// passes or the mailbox is closed.
    fn wait<F>(&self, timeout: Option<Duration>, mut attempt: F) -> Result<(), MailboxError>
    where
        F: FnMut(Duration) -> Result<bool, ChannelError>,
    {
        // A deadline past the end of time waits forever
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if self.is_closed() {
                return Err(MailboxError::Closed);
            }

            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.poll_interval),
                None => self.poll_interval,
            };

            if attempt(slice)? {
                return Ok(());
            }

            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    return Err(MailboxError::Timeout(timeout));
                }
            }
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let channel = self
            .channel
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(channel) = channel {
            if channel.close() {
                if let Err(e) = HandshakeLock::remove(&self.name) {
                    tracing::debug!(mailbox = %self.name, error = %e, "failed to unlink handshake");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExperimentMessage, Measurement};
    use std::sync::Arc;

    fn unique(tag: &str) -> String {
        format!("nperf-test-mbox-{}-{tag}", std::process::id())
    }

    fn config() -> MailboxConfig {
        MailboxConfig {
            capacity: 4096,
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let name = unique("order");
        let consumer = Mailbox::open(&name, &config()).unwrap();
        let producer = Mailbox::open(&name, &config()).unwrap();

        let sender = std::thread::spawn(move || {
            for i in 0..200 {
                let msg = ExperimentMessage::result(i, Measurement::new("order", i as u64, 1));
                producer.send(&msg, Some(Duration::from_secs(10))).unwrap();
            }
            producer
                .send(&ExperimentMessage::Completed, Some(Duration::from_secs(10)))
                .unwrap();
        });

        let mut received = Vec::new();
        loop {
            let msg: ExperimentMessage = consumer.receive(Some(Duration::from_secs(10))).unwrap();
            if msg.is_terminal() {
                break;
            }
            received.push(msg.descriptor().unwrap());
        }
        sender.join().unwrap();

        assert_eq!(received, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_receive_timeout_leaves_slot_usable() {
        let name = unique("timeout");
        let mailbox = Mailbox::open(&name, &config()).unwrap();

        let result: Result<ExperimentMessage, _> = mailbox.receive(Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(MailboxError::Timeout(_))));

        mailbox
            .send(&ExperimentMessage::Completed, Some(Duration::ZERO))
            .unwrap();
        let msg: ExperimentMessage = mailbox.receive(Some(Duration::ZERO)).unwrap();
        assert_eq!(msg, ExperimentMessage::Completed);
    }

    #[test]
    fn test_send_times_out_when_slot_full() {
        let name = unique("full");
        let mailbox = Mailbox::open(&name, &config()).unwrap();

        mailbox.send(&ExperimentMessage::Completed, None).unwrap();
        let second = mailbox.send(&ExperimentMessage::Completed, Some(Duration::from_millis(30)));
        assert!(matches!(second, Err(MailboxError::Timeout(_))));
    }

    #[test]
    fn test_oversized_message_leaves_slot_free() {
        let name = unique("oversized");
        let small = MailboxConfig {
            capacity: 64,
            ..config()
        };
        let mailbox = Mailbox::open(&name, &small).unwrap();

        let big = ExperimentMessage::error(1, "x".repeat(1024));
        assert!(matches!(
            mailbox.send(&big, Some(Duration::ZERO)),
            Err(MailboxError::Frame(FrameError::FrameTooLarge { .. }))
        ));

        mailbox
            .send(&ExperimentMessage::Completed, Some(Duration::ZERO))
            .unwrap();
    }

    #[test]
    fn test_close_unblocks_infinite_receive() {
        let name = unique("close");
        let mailbox = Arc::new(Mailbox::open(&name, &config()).unwrap());

        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || mailbox.receive::<ExperimentMessage>(None))
        };

        std::thread::sleep(Duration::from_millis(50));
        mailbox.close();

        assert!(matches!(waiter.join().unwrap(), Err(MailboxError::Closed)));
        assert!(matches!(
            mailbox.send(&ExperimentMessage::Completed, None),
            Err(MailboxError::Closed)
        ));
    }

    #[test]
    fn test_huge_timeout_waits_without_deadline() {
        let name = unique("huge-timeout");
        let mailbox = Arc::new(Mailbox::open(&name, &config()).unwrap());

        mailbox
            .send(&ExperimentMessage::Completed, Some(Duration::MAX))
            .unwrap();
        let msg: ExperimentMessage = mailbox.receive(Some(Duration::MAX)).unwrap();
        assert_eq!(msg, ExperimentMessage::Completed);

        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || mailbox.receive::<ExperimentMessage>(Some(Duration::MAX)))
        };
        std::thread::sleep(Duration::from_millis(50));
        mailbox.close();

        assert!(matches!(waiter.join().unwrap(), Err(MailboxError::Closed)));
    }

    #[test]
    fn test_capacity_mismatch_between_ends() {
        let name = unique("mismatch");
        let _lab = Mailbox::open(&name, &config()).unwrap();
        let worker = Mailbox::open(
            &name,
            &MailboxConfig {
                capacity: 8192,
                ..config()
            },
        );
        assert!(matches!(
            worker,
            Err(MailboxError::Channel(ChannelError::CapacityMismatch { .. }))
        ));
    }

    #[test]
    fn test_last_drop_releases_resources() {
        let name = unique("release");
        {
            let mailbox = Mailbox::open(&name, &config()).unwrap();
            mailbox.send(&ExperimentMessage::Completed, None).unwrap();
        }

        // A stale message must not survive into a fresh mailbox.
        let fresh = Mailbox::open(&name, &config()).unwrap();
        let result: Result<ExperimentMessage, _> = fresh.receive(Some(Duration::ZERO));
        assert!(matches!(result, Err(MailboxError::Timeout(_))));
    }

    #[test]
    fn test_remove_detaches_names_from_open_handles() {
        let name = unique("remove");
        let lab = Mailbox::open(&name, &config()).unwrap();
        let worker = Mailbox::open(&name, &config()).unwrap();

        Mailbox::remove(&name).unwrap();
        Mailbox::remove(&name).unwrap();

        // Open handles keep talking after the names are gone.
        worker.send(&ExperimentMessage::Completed, None).unwrap();
        let msg: ExperimentMessage = lab.receive(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(msg, ExperimentMessage::Completed);

        drop(lab);
        drop(worker);

        // A new open under the same name starts from scratch.
        let fresh = Mailbox::open(&name, &config()).unwrap();
        let result: Result<ExperimentMessage, _> = fresh.receive(Some(Duration::ZERO));
        assert!(matches!(result, Err(MailboxError::Timeout(_))));
    }
}
