//! Fan-out: one written stream broadcast to many sinks
//!
//! Every attached destination gets a private `ChunkQueue` and a worker thread
//! that drains it into the destination's sink. `FanOut::write()` only
//! enqueues, so a slow sink never stalls the writer or the other sinks.
//!
//! ```text
//!                   ┌─► queue A ─► worker A ─► sink A
//! FanOut::write() ──┼─► queue B ─► worker B ─► sink B
//!                   └─► queue C ─► worker C ─► sink C
//! ```
//!
//! # Failure isolation
//!
//! A sink that fails takes only its own destination down: the worker drops
//! the remaining queued chunks, closes the sink and leaves the broadcast set.
//! Writes keep going to the other destinations. Subscribe with
//! `FanOut::subscribe()` to learn about failures.
//!
//! # Shutdown
//!
//! `close()` stops accepting writes, lets every worker write out what is
//! still queued, flushes and closes the sinks, and waits for the workers.
//!
//! A destination that closes or fails is retired: its queue is released and
//! only its `DestinationInfo` is kept for `destinations()`.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::error::{FanError, Result};
use crate::handle::{Handle, HandleGen};
use crate::queue::{ChunkQueue, Pop};
use crate::state::{DestinationState, EngineStatus};

/// Capacity of the destination event channel; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Terminal event of one destination, published exactly once
#[derive(Debug, Clone)]
pub enum DestinationEvent {
    /// The sink failed; the destination left the broadcast set
    Failed {
        destination: Handle,
        error: FanError,
    },
    /// The destination drained its queue and closed its sink
    Closed { destination: Handle, name: String },
}

impl DestinationEvent {
    #[must_use]
    pub fn destination(&self) -> Handle {
        match self {
            Self::Failed { destination, .. } | Self::Closed { destination, .. } => *destination,
        }
    }
}

/// Snapshot of one attached destination
#[derive(Debug, Clone)]
pub struct DestinationInfo {
    pub handle: Handle,
    pub name: String,
    pub state: DestinationState,
    pub failure: Option<FanError>,
}

/// Destination whose worker has not reported a terminal state yet
struct DestinationEntry {
    info: DestinationInfo,
    queue: Arc<ChunkQueue>,
    detached: bool,
}

impl DestinationEntry {
    fn receives_writes(&self) -> bool {
        !self.detached && !self.info.state.is_terminal()
    }
}

struct FanOutState {
    status: EngineStatus,
    /// Destinations with a live worker
    destinations: Vec<DestinationEntry>,
    /// Closed or failed destinations; their queues are already released
    retired: Vec<DestinationInfo>,
}

impl FanOutState {
    fn entry_mut(&mut self, handle: Handle) -> Option<&mut DestinationEntry> {
        self.destinations.iter_mut().find(|e| e.info.handle == handle)
    }

    /// Move a destination out of the live set, keeping only its snapshot
    fn retire(&mut self, handle: Handle, state: DestinationState, failure: Option<FanError>) {
        if let Some(pos) = self.destinations.iter().position(|e| e.info.handle == handle) {
            let mut info = self.destinations.swap_remove(pos).info;
            info.state = state;
            info.failure = failure;
            self.retired.push(info);
        }
    }
}

/// State shared between the engine and its destination workers
struct FanOutShared {
    state: Mutex<FanOutState>,
    /// Signalled whenever a destination is retired
    workers_done: Condvar,
    events: broadcast::Sender<DestinationEvent>,
    handles: HandleGen,
}

impl FanOutShared {
    fn mark_writing(&self, handle: Handle) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entry_mut(handle) {
            entry.info.state = DestinationState::Writing;
        }
    }

    /// Events are published before the destination is retired, so
    /// `close()` returns only after every terminal event is out
    fn report_closed(&self, handle: Handle, name: &str) {
        {
            let mut state = self.state.lock();
            self.publish(DestinationEvent::Closed {
                destination: handle,
                name: name.to_string(),
            });
            state.retire(handle, DestinationState::Closed, None);
            debug!(destination = %handle, live = state.destinations.len(), "destination closed");
        }
        self.workers_done.notify_all();
    }

    fn report_error(&self, handle: Handle, name: &str, cause: io::Error) {
        let error = FanError::SinkWrite {
            destination: handle,
            name: name.to_string(),
            cause: Arc::new(cause),
        };
        {
            let mut state = self.state.lock();
            warn!(destination = %handle, %error, "destination failed, removed from broadcast");
            self.publish(DestinationEvent::Failed {
                destination: handle,
                error: error.clone(),
            });
            state.retire(handle, DestinationState::Errored, Some(error));
        }
        self.workers_done.notify_all();
    }

    fn publish(&self, event: DestinationEvent) {
        if let Err(e) = self.events.send(event) {
            debug!(event = ?e.0, "no subscribers for destination event");
        }
    }
}

/// Worker draining one destination queue into its sink
struct DestinationWorker {
    handle: Handle,
    name: String,
    sink: Box<dyn Write + Send>,
    queue: Arc<ChunkQueue>,
    shared: Arc<FanOutShared>,
}

impl DestinationWorker {
    fn run(self) {
        let Self {
            handle,
            name,
            sink,
            queue,
            shared,
        } = self;
        shared.mark_writing(handle);
        debug!(destination = %handle, %name, "destination worker started");

        // The sink is dropped inside the guarded block: a panicking `Drop`
        // must still end in a report, or `close()` would wait forever
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut sink = sink;
            let written = drain(&queue, sink.as_mut());
            if written.is_err() {
                // Stop accepting writes before the sink goes away
                queue.close();
                queue.interrupt();
            }
            drop(sink);
            written
        }))
        .unwrap_or_else(|_| Err(io::Error::other("destination sink panicked")));

        match outcome {
            Ok(()) => shared.report_closed(handle, &name),
            Err(e) => {
                queue.close();
                queue.interrupt();
                shared.report_error(handle, &name, e);
            }
        }
    }
}

/// Write queued chunks until the queue is drained or interrupted, then flush
fn drain(queue: &ChunkQueue, sink: &mut (dyn Write + Send)) -> io::Result<()> {
    loop {
        match queue.pop() {
            Pop::Chunk(chunk) => sink.write_all(chunk.bytes())?,
            Pop::Drained | Pop::Interrupted | Pop::TimedOut => break,
        }
    }
    sink.flush()
}

/// Broadcasts every write to all currently attached destinations.
///
/// All methods take `&self`; wrap the engine in an `Arc` to attach
/// destinations from one thread while another thread writes.
///
/// # Example
///
/// ```
/// use fanio::{FanOut, SharedBuffer};
///
/// let fan_out = FanOut::new();
/// let first = SharedBuffer::new();
/// let second = SharedBuffer::new();
/// fan_out.attach_destination(first.clone()).unwrap();
/// fan_out.attach_destination(second.clone()).unwrap();
///
/// fan_out.write(b"hello").unwrap();
/// fan_out.close().unwrap();
///
/// assert_eq!(first.contents(), b"hello");
/// assert_eq!(second.contents(), b"hello");
/// ```
pub struct FanOut {
    shared: Arc<FanOutShared>,
}

impl FanOut {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(FanOutShared {
                state: Mutex::new(FanOutState {
                    status: EngineStatus::Initialized,
                    destinations: Vec::new(),
                    retired: Vec::new(),
                }),
                workers_done: Condvar::new(),
                events,
                handles: HandleGen::new(),
            }),
        }
    }

    /// Attach a sink and start its worker thread.
    ///
    /// The destination receives only what is written after this call.
    ///
    /// # Errors
    ///
    /// - `ClosedStream` after `close()`
    /// - `WorkerSpawn` if the thread could not be started
    pub fn attach_destination<W>(&self, sink: W) -> Result<Handle>
    where
        W: Write + Send + 'static,
    {
        self.attach(None, Box::new(sink))
    }

    /// Like `attach_destination()`, with a name used in logs, errors and events
    pub fn attach_named_destination<W>(&self, name: &str, sink: W) -> Result<Handle>
    where
        W: Write + Send + 'static,
    {
        self.attach(Some(name), Box::new(sink))
    }

    /// Attach several sinks at once, stopping at the first failure
    pub fn attach_destinations<I, W>(&self, sinks: I) -> Result<Vec<Handle>>
    where
        I: IntoIterator<Item = W>,
        W: Write + Send + 'static,
    {
        sinks
            .into_iter()
            .map(|sink| self.attach_destination(sink))
            .collect()
    }

    fn attach(&self, name: Option<&str>, sink: Box<dyn Write + Send>) -> Result<Handle> {
        let handle = self.shared.handles.next_handle();
        let name = name.map_or_else(|| format!("destination-{}", handle.id()), str::to_string);
        let queue = Arc::new(ChunkQueue::new(&format!("fan-out {name}")));

        // Held across the spawn so no write can slip in before the entry exists
        let mut state = self.shared.state.lock();
        if state.status == EngineStatus::Closed {
            return Err(FanError::ClosedStream);
        }

        let worker = DestinationWorker {
            handle,
            name: name.clone(),
            sink,
            queue: Arc::clone(&queue),
            shared: Arc::clone(&self.shared),
        };
        // Detached; `close()` waits for the worker's terminal report
        thread::Builder::new()
            .name(format!("fanout-dst-{}", handle.id()))
            .spawn(move || worker.run())
            .map_err(|e| {
                warn!(destination = %handle, error = %e, "failed to spawn destination worker");
                FanError::WorkerSpawn(Arc::new(e))
            })?;

        state.destinations.push(DestinationEntry {
            info: DestinationInfo {
                handle,
                name: name.clone(),
                state: DestinationState::Attached,
                failure: None,
            },
            queue,
            detached: false,
        });
        state.status = EngineStatus::Running;

        debug!(destination = %handle, %name, live = state.destinations.len(), "destination attached");
        Ok(handle)
    }

    /// Stop broadcasting to one destination.
    ///
    /// Chunks already queued for it are still written, then its sink is
    /// closed. Detaching a destination that already terminated is a no-op.
    ///
    /// # Errors
    ///
    /// - `ClosedStream` after `close()`
    /// - `UnknownDestination` if the handle was not issued by this engine
    pub fn detach_destination(&self, handle: Handle) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.status == EngineStatus::Closed {
            return Err(FanError::ClosedStream);
        }
        if state.retired.iter().any(|info| info.handle == handle) {
            return Ok(());
        }
        let entry = state
            .entry_mut(handle)
            .ok_or(FanError::UnknownDestination(handle))?;
        if !entry.receives_writes() {
            return Ok(());
        }
        entry.detached = true;
        entry.queue.close();
        debug!(destination = %handle, queued = entry.queue.len(), "destination detached");
        Ok(())
    }

    /// Copy `bytes` once and enqueue it for every attached destination.
    ///
    /// Never waits for a sink. Failures of individual sinks are not reported
    /// here; see `subscribe()`.
    ///
    /// # Errors
    ///
    /// `ClosedStream` after `close()`.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        // Calls are serialized by the state lock, so every destination
        // queue receives chunks in the same order
        let state = self.shared.state.lock();
        if state.status == EngineStatus::Closed {
            return Err(FanError::ClosedStream);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let chunk = Chunk::new(None, bytes);
        for entry in state.destinations.iter().filter(|e| e.receives_writes()) {
            if entry.queue.push(chunk.clone()).is_err() {
                debug!(destination = %entry.info.handle, "destination queue closed, chunk skipped");
            }
        }
        Ok(())
    }

    /// Write a single byte
    pub fn write_byte(&self, byte: u8) -> Result<()> {
        self.write(&[byte])
    }

    /// Stop accepting writes and wait until every destination has written
    /// its queued chunks and closed its sink.
    ///
    /// Idempotent: a second call returns `Ok(())` once the workers are done.
    pub fn close(&self) -> Result<()> {
        self.close_inner(None)
    }

    /// Like `close()`, but gives up waiting after `timeout` with `TimedOut`.
    ///
    /// The engine is closed either way; workers that are still draining keep
    /// going in the background and a later `close()` can wait for them.
    pub fn close_timeout(&self, timeout: Duration) -> Result<()> {
        self.close_inner(Some((Instant::now() + timeout, timeout)))
    }

    fn close_inner(&self, deadline: Option<(Instant, Duration)>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.status != EngineStatus::Closed {
            info!(
                live = state.destinations.len(),
                retired = state.retired.len(),
                "closing fan-out"
            );
            state.status = EngineStatus::Closed;
            for entry in &state.destinations {
                entry.queue.close();
            }
        }

        while !state.destinations.is_empty() {
            match deadline {
                None => self.shared.workers_done.wait(&mut state),
                Some((deadline, timeout)) => {
                    if self
                        .shared
                        .workers_done
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && !state.destinations.is_empty()
                    {
                        return Err(FanError::TimedOut(timeout));
                    }
                }
            }
        }
        Ok(())
    }

    /// Receive an event whenever a destination fails or closes.
    ///
    /// Works without an async runtime through `blocking_recv()` or
    /// `try_recv()`. Only events published after the call are delivered.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DestinationEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.shared.state.lock().status
    }

    /// Snapshot of every destination attached so far, in attach order
    #[must_use]
    pub fn destinations(&self) -> Vec<DestinationInfo> {
        let state = self.shared.state.lock();
        let mut infos: Vec<DestinationInfo> = state
            .retired
            .iter()
            .cloned()
            .chain(state.destinations.iter().map(|e| e.info.clone()))
            .collect();
        infos.sort_by_key(|info| info.handle);
        infos
    }

    /// Destinations that still receive writes
    #[must_use]
    pub fn active_destinations(&self) -> usize {
        self.shared
            .state
            .lock()
            .destinations
            .iter()
            .filter(|e| e.receives_writes())
            .count()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for FanOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FanOut::write(self, buf)?;
        Ok(buf.len())
    }

    /// Delivery is asynchronous; use `close()` to wait for the sinks
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FanOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FanOut::write(*self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for FanOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        write!(
            f,
            "FanOut(status={}, live={}, retired={})",
            state.status,
            state.destinations.len(),
            state.retired.len()
        )
    }
}

impl Drop for FanOut {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "fan-out close on drop failed");
        }
    }
}
