//! Replay Log
//!
//! An append-only log of already-emitted items plus a terminal marker.
//! The writer (a session's drainer) owns the log; readers hold a [`Cursor`]
//! and see the full history first, then live items, then the terminal
//! signal. A reader that attaches late never misses anything.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal<E> {
    /// Normal end of stream
    Completed,
    /// The stream failed with `E`
    Failed(E),
}

/// What a reader observes, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<T, E> {
    /// Next item of the stream
    Item(T),
    /// The stream ended normally; no more events follow
    Completed,
    /// The stream failed; no more events follow
    Failed(E),
}

#[derive(Debug)]
struct LogState<T, E> {
    items: Vec<T>,
    terminal: Option<Terminal<E>>,
}

/// Ordered broadcast buffer with replay-on-subscribe.
#[derive(Debug)]
pub struct ReplayLog<T, E> {
    state: Mutex<LogState<T, E>>,
    changed: Condvar,
}

impl<T: Clone, E: Clone> Default for ReplayLog<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> ReplayLog<T, E> {
    /// An empty, open log
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                items: Vec::new(),
                terminal: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Ignored (returns `false`) once the log is terminated.
    pub fn publish(&self, item: T) -> bool {
        let mut state = self.state();
        if state.terminal.is_some() {
            return false;
        }
        state.items.push(item);
        self.changed.notify_all();
        true
    }

    /// Set the terminal marker. Only the first call has an effect.
    pub fn finish(&self, terminal: Terminal<E>) -> bool {
        let mut state = self.state();
        if state.terminal.is_some() {
            return false;
        }
        state.terminal = Some(terminal);
        self.changed.notify_all();
        true
    }

    /// Number of items published so far
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    /// Whether nothing has been published yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The terminal marker, if reached
    pub fn terminal(&self) -> Option<Terminal<E>> {
        self.state().terminal.clone()
    }

    /// A reader positioned at the start of the log
    pub fn cursor(self: &Arc<Self>) -> Cursor<T, E> {
        Cursor {
            log: Arc::clone(self),
            position: 0,
            ended: false,
        }
    }
}

/// A reader's position in a [`ReplayLog`].
#[derive(Debug)]
pub struct Cursor<T, E> {
    log: Arc<ReplayLog<T, E>>,
    position: usize,
    ended: bool,
}

impl<T: Clone, E: Clone> Cursor<T, E> {
    /// Next event, waiting at most `timeout` (`None` waits forever).
    ///
    /// Returns `None` on timeout, or always once the terminal event has been
    /// handed out.
    pub fn next_event(&mut self, timeout: Option<Duration>) -> Option<StreamEvent<T, E>> {
        if self.ended {
            return None;
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.log.state();

        loop {
            if let Some(item) = state.items.get(self.position) {
                self.position += 1;
                return Some(StreamEvent::Item(item.clone()));
            }

            if let Some(terminal) = &state.terminal {
                self.ended = true;
                return Some(match terminal {
                    Terminal::Completed => StreamEvent::Completed,
                    Terminal::Failed(e) => StreamEvent::Failed(e.clone()),
                });
            }

            state = match deadline {
                None => self
                    .log
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    self.log
                        .changed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Whether the terminal event has been handed out
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl<T: Clone, E: Clone> Iterator for Cursor<T, E> {
    type Item = StreamEvent<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event(None)
    }
}
