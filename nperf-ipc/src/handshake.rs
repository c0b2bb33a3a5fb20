//! Cross-Process Slot Handshake
//!
//! Two POSIX named semaphores guard the mailbox slot:
//! - `<name>.full` counts messages waiting in the slot (starts at 0)
//! - `<name>.empty` counts free slots (starts at 1)
//!
//! Producer: acquire empty, write, signal full.
//! Consumer: acquire full, read, signal empty.

use nix::errno::Errno;
use std::ffi::CString;
use std::ptr::NonNull;
use std::time::Duration;

use crate::channel::{ChannelError, validate_name};

fn full_name(name: &str) -> String {
    format!("/{name}.full")
}

fn empty_name(name: &str) -> String {
    format!("/{name}.empty")
}

/// A POSIX named counting semaphore.
struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    os_name: String,
}

// SAFETY: sem_wait/sem_post/sem_close are thread-safe on a valid handle.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn open(os_name: String, initial: u32) -> Result<Self, ChannelError> {
        let c_name = CString::new(os_name.as_str()).map_err(|_| ChannelError::InvalidName {
            name: os_name.clone(),
            reason: "name must not contain NUL",
        })?;

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ChannelError::Os {
                resource: os_name,
                source: Errno::last(),
            });
        }

        match NonNull::new(sem) {
            Some(sem) => Ok(Self { sem, os_name }),
            None => Err(ChannelError::Os {
                resource: os_name,
                source: Errno::EINVAL,
            }),
        }
    }

    fn unlink(os_name: &str) -> Result<(), ChannelError> {
        let c_name = CString::new(os_name).map_err(|_| ChannelError::InvalidName {
            name: os_name.to_string(),
            reason: "name must not contain NUL",
        })?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::ENOENT => Ok(()),
            source => Err(ChannelError::Os {
                resource: os_name.to_string(),
                source,
            }),
        }
    }

    fn os_err(&self) -> ChannelError {
        ChannelError::Os {
            resource: self.os_name.clone(),
            source: Errno::last(),
        }
    }

    /// Decrement the count, waiting at most `timeout` (`None` waits forever).
    /// Returns `false` if the timeout elapsed first.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        match timeout {
            None => loop {
                if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                    return Ok(true);
                }
                if Errno::last() != Errno::EINTR {
                    return Err(self.os_err());
                }
            },
            Some(timeout) if timeout.is_zero() => self.try_wait(),
            Some(timeout) => self.timed_wait(timeout),
        }
    }

    fn try_wait(&self) -> Result<bool, ChannelError> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EAGAIN => return Ok(false),
                Errno::EINTR => continue,
                _ => return Err(self.os_err()),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn timed_wait(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let deadline = realtime_deadline(timeout);
        loop {
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::ETIMEDOUT => return Ok(false),
                Errno::EINTR => continue,
                _ => return Err(self.os_err()),
            }
        }
    }

    // No sem_timedwait outside Linux: poll with a short sleep.
    #[cfg(not(target_os = "linux"))]
    fn timed_wait(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            std::thread::sleep(remaining.min(Duration::from_millis(1)));
        }
    }

    fn post(&self) -> Result<(), ChannelError> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(self.os_err())
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as sem_timedwait wants.
#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }

    let mut nanos = ts.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let mut secs = (ts.tv_sec as i64).saturating_add(timeout.as_secs().min(i64::MAX as u64) as i64);
    if nanos >= 1_000_000_000 {
        nanos -= 1_000_000_000;
        secs = secs.saturating_add(1);
    }
    ts.tv_sec = secs as _;
    ts.tv_nsec = nanos as _;
    ts
}

/// The full/empty semaphore pair guarding one mailbox slot.
pub struct HandshakeLock {
    full: NamedSemaphore,
    empty: NamedSemaphore,
}

impl HandshakeLock {
    /// Open (or create) the semaphore pair for `name`.
    pub fn open(name: &str) -> Result<Self, ChannelError> {
        validate_name(name)?;
        Ok(Self {
            full: NamedSemaphore::open(full_name(name), 0)?,
            empty: NamedSemaphore::open(empty_name(name), 1)?,
        })
    }

    /// Unlink both semaphore names. Open handles keep working.
    pub fn remove(name: &str) -> Result<(), ChannelError> {
        validate_name(name)?;
        NamedSemaphore::unlink(&full_name(name))?;
        NamedSemaphore::unlink(&empty_name(name))
    }

    /// Wait until the slot is free. Returns `false` on timeout.
    pub fn acquire_empty(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        self.empty.wait(timeout)
    }

    /// Mark a message as present.
    pub fn signal_full(&self) -> Result<(), ChannelError> {
        self.full.post()
    }

    /// Wait until a message is present. Returns `false` on timeout.
    pub fn acquire_full(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        self.full.wait(timeout)
    }

    /// Mark the slot as free.
    pub fn signal_empty(&self) -> Result<(), ChannelError> {
        self.empty.post()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn unique(tag: &str) -> String {
        format!("nperf-test-lock-{}-{tag}", std::process::id())
    }

    #[test]
    fn test_initial_state() {
        let name = unique("initial");
        HandshakeLock::remove(&name).unwrap();
        let lock = HandshakeLock::open(&name).unwrap();

        assert!(lock.acquire_empty(Some(Duration::ZERO)).unwrap());
        assert!(!lock.acquire_empty(Some(Duration::ZERO)).unwrap());
        assert!(!lock.acquire_full(Some(Duration::from_millis(20))).unwrap());

        HandshakeLock::remove(&name).unwrap();
    }

    #[test]
    fn test_full_wakes_waiter() {
        let name = unique("wake");
        HandshakeLock::remove(&name).unwrap();
        let consumer = Arc::new(HandshakeLock::open(&name).unwrap());
        let producer = HandshakeLock::open(&name).unwrap();

        let waiter = {
            let consumer = Arc::clone(&consumer);
            std::thread::spawn(move || consumer.acquire_full(Some(Duration::from_secs(5))))
        };

        assert!(producer.acquire_empty(None).unwrap());
        producer.signal_full().unwrap();
        assert!(waiter.join().unwrap().unwrap());

        consumer.signal_empty().unwrap();
        assert!(producer.acquire_empty(Some(Duration::ZERO)).unwrap());

        HandshakeLock::remove(&name).unwrap();
    }

    #[test]
    fn test_timeout_is_honoured() {
        let name = unique("timeout");
        HandshakeLock::remove(&name).unwrap();
        let lock = HandshakeLock::open(&name).unwrap();

        let start = Instant::now();
        assert!(!lock.acquire_full(Some(Duration::from_millis(50))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(45));

        HandshakeLock::remove(&name).unwrap();
    }
}
