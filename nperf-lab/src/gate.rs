//! Admission gate for non-parallel sessions.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct GateState {
    taken: Mutex<bool>,
    released: Condvar,
}

impl GateState {
    fn taken(&self) -> MutexGuard<'_, bool> {
        self.taken.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A binary semaphore, initially open.
///
/// Clones share the same gate. The lab creates one per process and hands it
/// to every session it builds; non-parallel sessions hold a [`GatePermit`]
/// for as long as they drain.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGate {
    state: Arc<GateState>,
}

impl ConcurrencyGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate is free, then take it.
    pub fn acquire(&self) -> GatePermit {
        let mut taken = self.state.taken();
        if *taken {
            tracing::debug!("waiting for concurrency gate");
        }
        while *taken {
            taken = self
                .state
                .released
                .wait(taken)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *taken = true;
        self.permit()
    }

    /// Take the gate if it frees up within `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<GatePermit> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.acquire());
        };
        let mut taken = self.state.taken();
        while *taken {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            taken = self
                .state
                .released
                .wait_timeout(taken, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *taken = true;
        Some(self.permit())
    }

    /// Whether nobody holds the gate right now
    pub fn is_available(&self) -> bool {
        !*self.state.taken()
    }

    fn permit(&self) -> GatePermit {
        GatePermit {
            state: Arc::clone(&self.state),
        }
    }
}

/// Proof of holding the gate; dropping it lets exactly one waiter in.
#[derive(Debug)]
pub struct GatePermit {
    state: Arc<GateState>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        *self.state.taken() = false;
        self.state.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_acquire_release() {
        let gate = ConcurrencyGate::new();
        assert!(gate.is_available());

        let permit = gate.acquire();
        assert!(!gate.is_available());
        assert!(gate.try_acquire_for(Duration::from_millis(10)).is_none());

        drop(permit);
        assert!(gate.is_available());
        assert!(gate.try_acquire_for(Duration::ZERO).is_some());
    }

    #[test]
    fn test_huge_timeout_waits_for_release() {
        let gate = ConcurrencyGate::new();
        assert!(gate.try_acquire_for(Duration::MAX).is_some());

        let permit = gate.acquire();
        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.try_acquire_for(Duration::MAX).is_some())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(permit);

        assert!(waiter.join().unwrap());
        assert!(gate.is_available());
    }

    #[test]
    fn test_second_waiter_blocks_until_release() {
        let gate = ConcurrencyGate::new();
        let permit = gate.acquire();

        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                let _permit = gate.acquire();
                Instant::now()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        let released_at = Instant::now();
        drop(permit);

        let admitted_at = waiter.join().unwrap();
        assert!(admitted_at >= released_at);
    }

    #[test]
    fn test_at_most_one_holder() {
        let gate = ConcurrencyGate::new();
        let inside = std::sync::Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let inside = std::sync::Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let _permit = gate.acquire();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(gate.is_available());
    }
}
