//! Ordered Concurrent Queue
//!
//! Any number of threads may enqueue; a single dispatch thread hands items
//! to the registered observer one at a time, in the order they were
//! accepted. The observer for item `n + 1` does not start until the one for
//! item `n` has returned.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use thiserror::Error;

/// Errors raised by [`OrderedQueue`]
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,

    #[error("Dispatch observer panicked: {0}")]
    DispatcherPanicked(String),

    #[error("Failed to start dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug)]
struct QueueState<T> {
    pending: VecDeque<T>,
    accepted: u64,
    closed: bool,
    panic: Option<String>,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Multi-producer queue with a single, ordered dispatch path.
pub struct OrderedQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_id: ThreadId,
}

impl<T: Send + 'static> OrderedQueue<T> {
    /// Create the queue and start its dispatch thread. `on_dispatched` is
    /// the single observer every item is handed to.
    pub fn new<F>(on_dispatched: F) -> Result<Self, QueueError>
    where
        F: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                accepted: 0,
                closed: false,
                panic: None,
            }),
            available: Condvar::new(),
        });

        let handle = std::thread::Builder::new()
            .name("nperf-dispatch".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || dispatch_loop(&shared, on_dispatched)
            })?;

        Ok(Self {
            shared,
            dispatcher_id: handle.thread().id(),
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Accept `item` for dispatch. Returns its acceptance sequence number,
    /// starting at 0; dispatch happens in that order.
    pub fn enqueue(&self, item: T) -> Result<u64, QueueError> {
        let mut state = self.shared.state();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let sequence = state.accepted;
        state.accepted += 1;
        state.pending.push_back(item);
        self.shared.available.notify_one();
        Ok(sequence)
    }

    /// Stop accepting items and wait until everything already accepted has
    /// been dispatched. Safe to call more than once.
    ///
    /// Called from inside the observer, it only marks the queue closed.
    pub fn close(&self) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state();
            state.closed = true;
            self.shared.available.notify_all();
        }

        if std::thread::current().id() == self.dispatcher_id {
            return Ok(());
        }

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                return Err(QueueError::DispatcherPanicked("dispatch thread died".to_string()));
            }
        }

        match &self.shared.state().panic {
            Some(message) => Err(QueueError::DispatcherPanicked(message.clone())),
            None => Ok(()),
        }
    }

    /// Whether [`OrderedQueue::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Items accepted but not yet handed to the observer
    pub fn pending(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Total items ever accepted
    pub fn accepted(&self) -> u64 {
        self.shared.state().accepted
    }
}

impl<T: Send + 'static> Drop for OrderedQueue<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "ordered queue closed with error");
        }
    }
}

fn dispatch_loop<T, F>(shared: &Shared<T>, mut on_dispatched: F)
where
    F: FnMut(T),
{
    loop {
        let item = {
            let mut state = shared.state();
            loop {
                if let Some(item) = state.pending.pop_front() {
                    break item;
                }
                if state.closed {
                    return;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_dispatched(item))) {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            let mut state = shared.state();
            tracing::error!(dropped = state.pending.len(), %message, "dispatch observer panicked");
            state.closed = true;
            state.pending.clear();
            state.panic = Some(message);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_producer_dispatches_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let seen = Arc::clone(&seen);
            OrderedQueue::new(move |item: u32| seen.lock().unwrap().push(item)).unwrap()
        };

        for i in 0..1000 {
            assert_eq!(queue.enqueue(i).unwrap(), u64::from(i));
        }
        queue.close().unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_producers_keep_acceptance_order() {
        let in_callback = Arc::new(AtomicBool::new(false));
        let dispatched = Arc::new(Mutex::new(Vec::new()));

        let queue = {
            let in_callback = Arc::clone(&in_callback);
            let dispatched = Arc::clone(&dispatched);
            Arc::new(
                OrderedQueue::new(move |item: usize| {
                    assert!(!in_callback.swap(true, Ordering::SeqCst), "overlapping dispatch");
                    dispatched
                        .lock()
                        .unwrap()
                        .push((item, std::thread::current().id()));
                    in_callback.store(false, Ordering::SeqCst);
                })
                .unwrap(),
            )
        };

        // 50 producers, 20 items each = items 0..999.
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let producers: Vec<_> = (0..50)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let accepted = Arc::clone(&accepted);
                std::thread::spawn(move || {
                    for k in 0..20 {
                        let item = p * 20 + k;
                        // Hold the lock across enqueue so the recorded order is the accepted order.
                        let mut accepted = accepted.lock().unwrap();
                        let sequence = queue.enqueue(item).unwrap();
                        accepted.push((sequence, item));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        queue.close().unwrap();

        let dispatched = dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1000);

        let dispatched_items: Vec<usize> = dispatched.iter().map(|(item, _)| *item).collect();
        let accepted = accepted.lock().unwrap();
        assert!(accepted.windows(2).all(|pair| pair[0].0 < pair[1].0));
        let accepted_items: Vec<usize> = accepted.iter().map(|(_, item)| *item).collect();
        assert_eq!(dispatched_items, accepted_items);

        let mut unique = dispatched_items.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique, (0..1000).collect::<Vec<_>>());

        let dispatch_thread = dispatched[0].1;
        assert!(dispatched.iter().all(|(_, thread)| *thread == dispatch_thread));
        assert_ne!(dispatch_thread, std::thread::current().id());
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let seen = Arc::clone(&seen);
            OrderedQueue::new(move |item: &'static str| seen.lock().unwrap().push(item)).unwrap()
        };

        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();
        queue.close().unwrap();

        assert!(matches!(queue.enqueue("c"), Err(QueueError::Closed)));
        assert_eq!(queue.accepted(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        queue.close().unwrap();
    }

    #[test]
    fn test_close_waits_for_slow_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let seen = Arc::clone(&seen);
            OrderedQueue::new(move |item: u8| {
                std::thread::sleep(Duration::from_millis(5));
                seen.lock().unwrap().push(item);
            })
            .unwrap()
        };

        for i in 0..10 {
            queue.enqueue(i).unwrap();
        }
        queue.close().unwrap();

        assert_eq!(queue.pending(), 0);
        assert_eq!(seen.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_observer_panic_is_reported() {
        let queue = OrderedQueue::new(|item: u8| {
            if item == 2 {
                panic!("bad item");
            }
        })
        .unwrap();

        for i in 0..5 {
            let _ = queue.enqueue(i);
        }
        match queue.close() {
            Err(QueueError::DispatcherPanicked(message)) => assert_eq!(message, "bad item"),
            other => panic!("expected panic report, got {other:?}"),
        }
        assert!(matches!(queue.enqueue(9), Err(QueueError::Closed)));
    }
}
