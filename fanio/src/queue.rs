//! Chunk queue: unbounded, ordered, blocking on empty
//!
//! The building block shared by both engines. Producers `push()`, consumers
//! `pop()`; a consumer parks on the condition variable while there is
//! nothing to take.
//!
//! # Wait discipline
//!
//! Every wait happens inside a loop that re-evaluates the queue state under
//! the lock after each wakeup:
//!
//! ```ignore
//! let mut state = self.state.lock();
//! loop {
//!     match state.next_action() {
//!         Action::Wait => self.available.wait(&mut state),
//!         done => return done,
//!     }
//! }
//! ```
//!
//! The state check and the registration as a waiter are atomic with respect
//! to `push()`, `close()` and `interrupt()`, which all change the state under
//! the same lock before notifying. A notification can therefore never fall
//! between the check and the wait, and a spurious wakeup only costs one more
//! round of the loop.
//!
//! # Terminal signals
//!
//! - `close()`: no more pushes. Consumers take what is left, then get
//!   `Pop::Drained`.
//! - `interrupt()`: consumers get `Pop::Interrupted` immediately, even if
//!   chunks are still queued. Pushes are still accepted until `close()`.
//! - `reopen()` undoes `close()` on a queue that was not interrupted.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use crate::chunk::Chunk;

/// Result of a blocking dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    /// Next chunk in FIFO order
    Chunk(Chunk),
    /// Queue is closed and empty
    Drained,
    /// Queue was interrupted; queued chunks were not handed out
    Interrupted,
    /// Deadline passed while the queue was empty and open
    TimedOut,
}

/// What a consumer should do with the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitAction {
    /// Nothing to take yet
    Wait,
    /// A chunk is at the front
    Take,
    /// Closed and nothing left
    Drained,
    /// Interrupted, takes priority over queued chunks
    Interrupted,
}

struct QueueState {
    chunks: VecDeque<Chunk>,
    closed: bool,
    interrupted: bool,
}

impl QueueState {
    /// Priority order:
    /// 1. Interrupted - regardless of queued chunks
    /// 2. Take - a chunk is available
    /// 3. Drained - closed and empty
    /// 4. Wait
    fn next_action(&self) -> WaitAction {
        if self.interrupted {
            WaitAction::Interrupted
        } else if !self.chunks.is_empty() {
            WaitAction::Take
        } else if self.closed {
            WaitAction::Drained
        } else {
            WaitAction::Wait
        }
    }
}

/// Thread-safe unbounded FIFO of chunks with blocking dequeue
pub struct ChunkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    debug_hint: String,
}

impl ChunkQueue {
    #[must_use]
    pub fn new(debug_hint: &str) -> Self {
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                closed: false,
                interrupted: false,
            }),
            available: Condvar::new(),
            debug_hint: debug_hint.to_string(),
        }
    }

    /// Append a chunk and wake one waiting consumer.
    ///
    /// # Errors
    ///
    /// Returns the chunk back if the queue is closed.
    pub fn push(&self, chunk: Chunk) -> Result<(), Chunk> {
        {
            let mut state = self.state.lock();
            if state.closed {
                log::debug!(
                    "queue.push: {} is closed, rejecting {chunk:?}",
                    self.debug_hint
                );
                return Err(chunk);
            }
            state.chunks.push_back(chunk);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Block until a chunk is available or the queue reaches a terminal state
    pub fn pop(&self) -> Pop {
        self.pop_inner(None)
    }

    /// Like `pop()`, but gives up at `deadline` with `Pop::TimedOut`
    pub fn pop_until(&self, deadline: Instant) -> Pop {
        self.pop_inner(Some(deadline))
    }

    fn pop_inner(&self, deadline: Option<Instant>) -> Pop {
        let mut state = self.state.lock();
        loop {
            match state.next_action() {
                WaitAction::Interrupted => return Pop::Interrupted,
                WaitAction::Drained => return Pop::Drained,
                WaitAction::Take => {
                    if let Some(chunk) = state.chunks.pop_front() {
                        return Pop::Chunk(chunk);
                    }
                }
                WaitAction::Wait => match deadline {
                    None => self.available.wait(&mut state),
                    Some(deadline) => {
                        if self.available.wait_until(&mut state, deadline).timed_out()
                            && state.next_action() == WaitAction::Wait
                        {
                            return Pop::TimedOut;
                        }
                    }
                },
            }
        }
    }

    /// Stop accepting chunks; consumers drain the rest, then see `Drained`.
    ///
    /// Idempotent. Wakes every waiting consumer.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            log::debug!(
                "queue.close: {}, {} chunk(s) left to drain",
                self.debug_hint,
                state.chunks.len()
            );
        }
        self.available.notify_all();
    }

    /// Accept pushes again after `close()`.
    ///
    /// Used when a new producer joins a queue that was closed because every
    /// earlier producer finished. An interrupted queue stays closed; returns
    /// whether the queue is open afterwards.
    pub fn reopen(&self) -> bool {
        let mut state = self.state.lock();
        if state.interrupted {
            return false;
        }
        if state.closed {
            state.closed = false;
            log::debug!(
                "queue.reopen: {}, {} chunk(s) still queued",
                self.debug_hint,
                state.chunks.len()
            );
        }
        true
    }

    /// Make every current and future `pop()` return `Interrupted`.
    ///
    /// Idempotent. Wakes every waiting consumer.
    pub fn interrupt(&self) {
        {
            let mut state = self.state.lock();
            if state.interrupted {
                return;
            }
            state.interrupted = true;
            log::debug!(
                "queue.interrupt: {}, {} chunk(s) not handed out",
                self.debug_hint,
                state.chunks.len()
            );
        }
        self.available.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }
}

impl fmt::Debug for ChunkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "ChunkQueue(hint={}, len={}, closed={}, interrupted={})",
            self.debug_hint,
            state.chunks.len(),
            state.closed,
            state.interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn chunk(bytes: &[u8]) -> Chunk {
        Chunk::new(None, bytes)
    }

    #[test]
    fn test_fifo_order() {
        let queue = ChunkQueue::new("test");
        queue.push(chunk(b"a")).unwrap();
        queue.push(chunk(b"b")).unwrap();
        queue.push(chunk(b"c")).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Pop::Chunk(chunk(b"a")));
        assert_eq!(queue.pop(), Pop::Chunk(chunk(b"b")));
        assert_eq!(queue.pop(), Pop::Chunk(chunk(b"c")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_drains_then_reports_drained() {
        let queue = ChunkQueue::new("test");
        queue.push(chunk(b"last")).unwrap();
        queue.close();

        assert_eq!(queue.pop(), Pop::Chunk(chunk(b"last")));
        assert_eq!(queue.pop(), Pop::Drained);
        assert_eq!(queue.pop(), Pop::Drained);
    }

    #[test]
    fn test_push_after_close_hands_chunk_back() {
        let queue = ChunkQueue::new("test");
        queue.close();
        let rejected = queue.push(chunk(b"late")).unwrap_err();
        assert_eq!(rejected.bytes(), b"late");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interrupt_takes_priority_over_queued_chunks() {
        let queue = ChunkQueue::new("test");
        queue.push(chunk(b"a")).unwrap();
        queue.push(chunk(b"b")).unwrap();
        queue.interrupt();

        assert_eq!(queue.pop(), Pop::Interrupted);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_close_and_interrupt_are_idempotent() {
        let queue = ChunkQueue::new("test");
        queue.close();
        queue.close();
        queue.interrupt();
        queue.interrupt();
        assert!(queue.is_closed());
        assert!(queue.is_interrupted());
    }

    #[test]
    fn test_reopen_accepts_pushes_and_keeps_chunks() {
        let queue = ChunkQueue::new("test");
        queue.push(chunk(b"kept")).unwrap();
        queue.close();
        assert!(queue.push(chunk(b"rejected")).is_err());

        assert!(queue.reopen());
        queue.push(chunk(b"new")).unwrap();

        assert_eq!(queue.pop(), Pop::Chunk(chunk(b"kept")));
        assert_eq!(queue.pop(), Pop::Chunk(chunk(b"new")));
        assert!(!queue.is_closed());
    }

    #[test]
    fn test_interrupted_queue_does_not_reopen() {
        let queue = ChunkQueue::new("test");
        queue.interrupt();
        queue.close();

        assert!(!queue.reopen());
        assert!(queue.is_closed());
    }

    #[test]
    fn test_pop_until_times_out_on_empty_open_queue() {
        let queue = ChunkQueue::new("test");
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(queue.pop_until(deadline), Pop::TimedOut);
    }

    #[test]
    fn test_blocked_consumer_wakes_on_push() {
        let queue = Arc::new(ChunkQueue::new("test"));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(chunk(b"wake")).unwrap();

        assert_eq!(consumer.join().unwrap(), Pop::Chunk(chunk(b"wake")));
    }

    #[test]
    fn test_close_wakes_every_blocked_consumer() {
        let queue = Arc::new(ChunkQueue::new("test"));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), Pop::Drained);
        }
    }

    #[test]
    fn test_interrupt_wakes_blocked_consumer() {
        let queue = Arc::new(ChunkQueue::new("test"));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.interrupt();

        assert_eq!(consumer.join().unwrap(), Pop::Interrupted);
    }

    #[test]
    fn test_many_producers_keep_per_producer_order() {
        let queue = Arc::new(ChunkQueue::new("test"));
        let producers: Vec<_> = (0u8..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0u8..50 {
                        queue.push(chunk(&[p, i])).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        queue.close();

        let mut next = [0u8; 4];
        while let Pop::Chunk(c) = queue.pop() {
            let [p, i] = [c.bytes()[0], c.bytes()[1]];
            assert_eq!(next[p as usize], i);
            next[p as usize] += 1;
        }
        assert_eq!(next, [50; 4]);
    }
}
