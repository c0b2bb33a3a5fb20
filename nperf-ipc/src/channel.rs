//! Named Shared Memory Channel
//!
//! A fixed-capacity byte region mapped into both the lab and the worker.
//! The channel itself does no locking; the mailbox handshake decides who
//! may touch the bytes and when.
//!
//! Segment layout (`/dev/shm/<name>` on Linux):
//!
//! ```text
//! +------------------------------+-----------------+-----------------+
//! | slot (capacity, padded to 8) | attached (u32)  | capacity (u32)  |
//! +------------------------------+-----------------+-----------------+
//! ```
//!
//! The trailer is private bookkeeping: the opener checks the creator's
//! capacity against its own, and the last handle to detach unlinks the name.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::{Mode, fstat};
use nix::unistd;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::framing::FRAME_HEADER_LEN;

/// Longest accepted channel name (the OS adds a prefix and suffixes)
pub const MAX_NAME_LEN: usize = 200;

const TRAILER_LEN: usize = 8;

/// How long an opener waits for a concurrent creator to finish initializing
const ATTACH_WAIT: Duration = Duration::from_secs(2);

/// Errors raised while opening or accessing a shared channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid channel name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Invalid channel capacity: {0} bytes")]
    InvalidCapacity(usize),

    #[error("Channel {name} exists with capacity {existing}, requested {requested}")]
    CapacityMismatch {
        name: String,
        existing: usize,
        requested: usize,
    },

    #[error("Channel {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Access of {len} bytes at offset {offset} exceeds channel capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("OS error on {resource}: {source}")]
    Os {
        resource: String,
        #[source]
        source: Errno,
    },
}

/// Check that `name` can be used as the base of the channel's OS resources.
pub fn validate_name(name: &str) -> Result<(), ChannelError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.len() > MAX_NAME_LEN {
        "name is too long"
    } else if name.contains('/') {
        "name must not contain '/'"
    } else if name.contains('\0') {
        "name must not contain NUL"
    } else {
        return Ok(());
    };
    Err(ChannelError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

fn segment_name(name: &str) -> String {
    format!("/{name}")
}

fn segment_len(capacity: usize) -> usize {
    capacity.next_multiple_of(8) + TRAILER_LEN
}

#[repr(C)]
struct Trailer {
    attached: AtomicU32,
    capacity: AtomicU32,
}

/// Handle to a named shared memory slot.
pub struct SharedChannel {
    name: String,
    capacity: usize,
    map_ptr: NonNull<libc::c_void>,
    map_len: usize,
    _fd: OwnedFd,
    creator: bool,
    attached: bool,
}

// SAFETY: the mapping lives as long as the handle. Reads copy out through
// `&self`, writes need `&mut self`; cross-process exclusion is the mailbox
// handshake's job.
unsafe impl Send for SharedChannel {}
unsafe impl Sync for SharedChannel {}

impl SharedChannel {
    /// Create the channel, or attach to it if another process created it first.
    pub fn open(name: &str, capacity: usize) -> Result<Self, ChannelError> {
        validate_name(name)?;
        if capacity <= FRAME_HEADER_LEN || capacity > u32::MAX as usize {
            return Err(ChannelError::InvalidCapacity(capacity));
        }

        let os_name = segment_name(name);
        let os_err = |source: Errno| ChannelError::Os {
            resource: os_name.clone(),
            source,
        };

        let created = mman::shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );

        let (fd, map_len, creator) = match created {
            Ok(fd) => {
                let map_len = segment_len(capacity);
                if let Err(e) = unistd::ftruncate(&fd, map_len as libc::off_t) {
                    let _ = mman::shm_unlink(os_name.as_str());
                    return Err(os_err(e));
                }
                (fd, map_len, true)
            }
            Err(Errno::EEXIST) => {
                let fd = mman::shm_open(os_name.as_str(), OFlag::O_RDWR, Mode::empty())
                    .map_err(os_err)?;
                let map_len = wait_for_size(&fd, name)?;
                (fd, map_len, false)
            }
            Err(e) => return Err(os_err(e)),
        };

        let len = NonZeroUsize::new(map_len).ok_or(ChannelError::InvalidCapacity(capacity))?;
        let map_ptr = unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| {
            if creator {
                let _ = mman::shm_unlink(os_name.as_str());
            }
            os_err(e)
        })?;

        let mut channel = Self {
            name: name.to_string(),
            capacity,
            map_ptr,
            map_len,
            _fd: fd,
            creator,
            attached: false,
        };

        if creator {
            channel
                .trailer()
                .capacity
                .store(capacity as u32, Ordering::Release);
        } else {
            let existing = channel.wait_for_capacity()?;
            if existing != capacity {
                return Err(ChannelError::CapacityMismatch {
                    name: name.to_string(),
                    existing,
                    requested: capacity,
                });
            }
        }

        channel.trailer().attached.fetch_add(1, Ordering::AcqRel);
        channel.attached = true;

        tracing::trace!(channel = %channel.name, capacity, creator, "shared channel attached");
        Ok(channel)
    }

    /// Remove a channel name left behind by a crashed process.
    pub fn remove(name: &str) -> Result<(), ChannelError> {
        validate_name(name)?;
        let os_name = segment_name(name);
        match mman::shm_unlink(os_name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(source) => Err(ChannelError::Os {
                resource: os_name,
                source,
            }),
        }
    }

    /// Base name shared by both processes
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the segment (as opposed to attaching)
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Usable bytes in the slot
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the slot.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), ChannelError> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map_ptr.as_ptr().cast::<u8>().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `bytes` into the slot starting at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ChannelError> {
        self.check_bounds(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map_ptr.as_ptr().cast::<u8>().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Detach from the segment. Returns `true` if this was the last handle,
    /// in which case the name has been unlinked.
    pub fn close(mut self) -> bool {
        self.detach()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), ChannelError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(ChannelError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }

    fn trailer(&self) -> &Trailer {
        // SAFETY: map_len - TRAILER_LEN is a multiple of 8 inside a
        // page-aligned mapping that outlives `self`.
        unsafe {
            &*self
                .map_ptr
                .as_ptr()
                .cast::<u8>()
                .add(self.map_len - TRAILER_LEN)
                .cast::<Trailer>()
        }
    }

    fn wait_for_capacity(&self) -> Result<usize, ChannelError> {
        let deadline = Instant::now() + ATTACH_WAIT;
        loop {
            let stored = self.trailer().capacity.load(Ordering::Acquire) as usize;
            if stored != 0 {
                return Ok(stored);
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::Unavailable {
                    name: self.name.clone(),
                    reason: "creator never published the channel capacity".to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn detach(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        self.attached = false;

        let last = self.trailer().attached.fetch_sub(1, Ordering::AcqRel) == 1;
        if last {
            if let Err(e) = mman::shm_unlink(segment_name(&self.name).as_str()) {
                tracing::debug!(
                    channel = %self.name,
                    error = %e,
                    "failed to unlink shared channel"
                );
            }
        }
        last
    }
}

impl Drop for SharedChannel {
    fn drop(&mut self) {
        self.detach();
        unsafe {
            let _ = mman::munmap(self.map_ptr, self.map_len);
        }
    }
}

/// Wait until a concurrent creator has sized the segment.
fn wait_for_size(fd: &OwnedFd, name: &str) -> Result<usize, ChannelError> {
    let deadline = Instant::now() + ATTACH_WAIT;
    loop {
        let stat = fstat(fd.as_raw_fd()).map_err(|source| ChannelError::Os {
            resource: segment_name(name),
            source,
        })?;
        let size = stat.st_size as usize;
        if size > TRAILER_LEN {
            return Ok(size);
        }
        if Instant::now() >= deadline {
            return Err(ChannelError::Unavailable {
                name: name.to_string(),
                reason: "segment exists but was never sized".to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("nperf-test-chan-{}-{tag}", std::process::id())
    }

    #[test]
    fn test_two_handles_share_bytes() {
        let name = unique("share");
        let mut writer = SharedChannel::open(&name, 64).unwrap();
        let reader = SharedChannel::open(&name, 64).unwrap();

        writer.write(3, b"hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read(3, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_capacity_mismatch() {
        let name = unique("mismatch");
        let _first = SharedChannel::open(&name, 100).unwrap();
        let second = SharedChannel::open(&name, 101);
        assert!(matches!(
            second,
            Err(ChannelError::CapacityMismatch {
                existing: 100,
                requested: 101,
                ..
            })
        ));
    }

    #[test]
    fn test_last_close_unlinks() {
        let name = unique("unlink");
        let first = SharedChannel::open(&name, 64).unwrap();
        let mut second = SharedChannel::open(&name, 64).unwrap();
        second.write(0, &[7; 8]).unwrap();

        assert!(!first.close());
        assert!(second.close());

        // A fresh segment is created, zero-filled, and may use a new capacity.
        let fresh = SharedChannel::open(&name, 32).unwrap();
        let mut buf = [1u8; 8];
        fresh.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn test_out_of_bounds() {
        let name = unique("bounds");
        let mut channel = SharedChannel::open(&name, 16).unwrap();
        assert!(matches!(
            channel.write(10, &[0; 8]),
            Err(ChannelError::OutOfBounds { .. })
        ));
        let mut buf = [0u8; 17];
        assert!(channel.read(0, &mut buf).is_err());
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name("nperf-1234-0").is_ok());
    }

    #[test]
    fn test_invalid_capacity() {
        let name = unique("capacity");
        assert!(matches!(
            SharedChannel::open(&name, FRAME_HEADER_LEN),
            Err(ChannelError::InvalidCapacity(_))
        ));
    }
}
