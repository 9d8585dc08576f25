//! Fan-in: many sources merged into one readable stream
//!
//! Every attached source gets a dedicated worker thread. The worker reads
//! chunks from its source, runs them through the optional chunk filter and
//! pushes them onto one shared `ChunkQueue`; `FanIn::read()` consumes from
//! that queue.
//!
//! ```text
//! source A ─► worker A ──┐
//! source B ─► worker B ──┼─► ChunkQueue ─► FanIn::read()
//! source C ─► worker C ──┘
//! ```
//!
//! Chunks of one source arrive in the order they were read. Chunks of
//! different sources interleave in whatever order the workers pushed them.
//!
//! # Completion
//!
//! When the last running source reaches end of stream, the queue is closed:
//! readers drain what is left and then get end of stream (`Ok(0)`). A source
//! attached before a reader has seen that end of stream reopens the queue,
//! so attaching one source after another never races a fast source.
//!
//! The first source that fails sets a sticky error. From then on every
//! `read()` returns that error, even if chunks are still queued, so a caller
//! never mistakes a failed merge for a complete one. The queue stops
//! accepting chunks and the remaining workers stop after their current read.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::error::{FanError, Result};
use crate::handle::{Handle, HandleGen};
use crate::queue::{ChunkQueue, Pop};
use crate::state::{EngineStatus, SourceState};

/// Read buffer size of a source worker unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Transform applied to every chunk on the producing worker's thread
pub type ChunkFilter = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Fan-in configuration
#[derive(Clone)]
pub struct FanInOptions {
    /// Read buffer size of each source worker, fixed when the source is attached
    pub chunk_size: usize,
    /// Optional chunk transform; `None` passes chunks through unchanged
    pub filter: Option<ChunkFilter>,
}

impl Default for FanInOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            filter: None,
        }
    }
}

impl fmt::Debug for FanInOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanInOptions")
            .field("chunk_size", &self.chunk_size)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Snapshot of one attached source
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub handle: Handle,
    pub name: String,
    pub state: SourceState,
    /// Failure of this source, whether or not it became the sticky error
    pub failure: Option<FanError>,
}

struct FanInState {
    status: EngineStatus,
    sources: Vec<SourceInfo>,
    /// Sources not yet in a terminal state
    active: usize,
    /// First source failure; never overwritten
    error: Option<FanError>,
}

impl FanInState {
    fn source_mut(&mut self, handle: Handle) -> Option<&mut SourceInfo> {
        self.sources.iter_mut().find(|s| s.handle == handle)
    }
}

/// State shared between the engine and its source workers
struct FanInShared {
    queue: ChunkQueue,
    state: Mutex<FanInState>,
    options: RwLock<FanInOptions>,
    handles: HandleGen,
}

impl FanInShared {
    /// Workers stop once nothing they read could be delivered anymore
    fn should_stop(&self) -> bool {
        matches!(
            self.state.lock().status,
            EngineStatus::Closed | EngineStatus::Errored
        )
    }

    fn mark_reading(&self, handle: Handle) {
        let mut state = self.state.lock();
        if let Some(source) = state.source_mut(handle) {
            source.state = SourceState::Reading;
        }
    }

    fn apply_filter(&self, bytes: Vec<u8>) -> Vec<u8> {
        // Clone the filter out so a slow filter does not hold the options lock
        let filter = self.options.read().filter.clone();
        match filter {
            Some(filter) => filter(bytes),
            None => bytes,
        }
    }

    /// Source reached end of stream, or stopped because of `close()`
    fn report_finished(&self, handle: Handle) {
        let mut state = self.state.lock();
        if let Some(source) = state.source_mut(handle) {
            source.state = SourceState::Finished;
        }
        state.active = state.active.saturating_sub(1);
        debug!(source = %handle, remaining = state.active, "source finished");
        self.close_queue_if_idle(&mut state);
    }

    /// Source failed; the first failure becomes the sticky engine error
    fn report_error(&self, handle: Handle, name: &str, cause: io::Error) {
        let error = FanError::SourceRead {
            source_id: handle,
            name: name.to_string(),
            cause: Arc::new(cause),
        };

        let mut state = self.state.lock();
        if let Some(source) = state.source_mut(handle) {
            source.state = SourceState::Errored;
            source.failure = Some(error.clone());
        }
        state.active = state.active.saturating_sub(1);

        if state.status == EngineStatus::Closed {
            debug!(source = %handle, %error, "source failed after close");
        } else if state.error.is_none() {
            warn!(source = %handle, %error, "source failed, fan-in stream errored");
            state.error = Some(error);
            state.status = EngineStatus::Errored;
            self.queue.interrupt();
            self.queue.close();
        } else {
            warn!(source = %handle, %error, "source failed, first error already recorded");
        }
        self.close_queue_if_idle(&mut state);
    }

    fn close_queue_if_idle(&self, state: &mut FanInState) {
        if state.active > 0 {
            return;
        }
        if state.status == EngineStatus::Running {
            state.status = EngineStatus::Draining;
            debug!("all sources done, draining");
        }
        self.queue.close();
    }

    /// Consumer saw the closed queue run dry.
    ///
    /// Returns false if a source was attached in the meantime and reopened
    /// the queue; the consumer then waits for its chunks instead.
    fn mark_drained(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            EngineStatus::Draining => {
                state.status = EngineStatus::Finished;
                info!(sources = state.sources.len(), "fan-in stream finished");
                true
            }
            EngineStatus::Finished => true,
            _ => false,
        }
    }

    /// Fails if reading is no longer meaningful: closed engine or sticky error
    fn check_readable(&self) -> Result<()> {
        let state = self.state.lock();
        if state.status == EngineStatus::Closed {
            return Err(FanError::ClosedStream);
        }
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Worker driving one source on its own thread
struct SourceWorker {
    handle: Handle,
    name: String,
    reader: Box<dyn Read + Send>,
    chunk_size: usize,
    shared: Arc<FanInShared>,
}

impl SourceWorker {
    fn run(mut self) {
        self.shared.mark_reading(self.handle);
        debug!(source = %self.handle, name = %self.name, "source worker started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.pump()))
            .unwrap_or_else(|_| Err(io::Error::other("source reader panicked")));

        let Self {
            handle,
            name,
            reader,
            shared,
            ..
        } = self;
        drop(reader);
        match outcome {
            Ok(()) => shared.report_finished(handle),
            Err(e) => shared.report_error(handle, &name, e),
        }
    }

    /// Move chunks from the source to the shared queue until end of stream,
    /// shutdown, or a read failure
    fn pump(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if self.shared.should_stop() {
                debug!(source = %self.handle, "fan-in stopped, source worker stopping");
                return Ok(());
            }

            let n = match self.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            let bytes = self.shared.apply_filter(buf[..n].to_vec());
            if bytes.is_empty() {
                continue;
            }
            if self
                .shared
                .queue
                .push(Chunk::new(Some(self.handle), bytes))
                .is_err()
            {
                debug!(source = %self.handle, "queue closed, source worker stopping");
                return Ok(());
            }
        }
    }
}

/// Partially consumed chunk, kept between `read()` calls
struct Pending {
    chunk: Chunk,
    pos: usize,
}

impl Pending {
    fn copy_to(&mut self, buf: &mut [u8]) -> usize {
        let rest = &self.chunk.bytes()[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        n
    }

    fn is_consumed(&self) -> bool {
        self.pos >= self.chunk.len()
    }
}

/// Merges any number of sources into one sequential byte stream.
///
/// All methods take `&self`; wrap the engine in an `Arc` to attach sources
/// from one thread while another thread reads.
///
/// # Example
///
/// ```
/// use fanio::FanIn;
/// use std::io::Read;
///
/// let fan_in = FanIn::new();
/// fan_in.attach_source(&b"AAA"[..]).unwrap();
/// fan_in.attach_source(&b"BBB"[..]).unwrap();
///
/// let mut merged = Vec::new();
/// (&fan_in).read_to_end(&mut merged).unwrap();
/// assert_eq!(merged.len(), 6);
/// ```
pub struct FanIn {
    shared: Arc<FanInShared>,
    pending: Mutex<Option<Pending>>,
}

impl FanIn {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(FanInOptions::default())
    }

    #[must_use]
    pub fn with_options(mut options: FanInOptions) -> Self {
        options.chunk_size = options.chunk_size.max(1);
        Self {
            shared: Arc::new(FanInShared {
                queue: ChunkQueue::new("fan-in"),
                state: Mutex::new(FanInState {
                    status: EngineStatus::Initialized,
                    sources: Vec::new(),
                    active: 0,
                    error: None,
                }),
                options: RwLock::new(options),
                handles: HandleGen::new(),
            }),
            pending: Mutex::new(None),
        }
    }

    /// Read buffer size for sources attached from now on. Zero is treated as one.
    pub fn set_chunk_size_hint(&self, chunk_size: usize) {
        self.shared.options.write().chunk_size = chunk_size.max(1);
    }

    /// Install a chunk transform, replacing any previous one.
    ///
    /// Applies to every chunk read after the call, including chunks of
    /// sources that are already running. A filter returning an empty vector
    /// drops the chunk.
    pub fn set_chunk_filter<F>(&self, filter: F)
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        self.shared.options.write().filter = Some(Arc::new(filter));
    }

    pub fn clear_chunk_filter(&self) {
        self.shared.options.write().filter = None;
    }

    /// Attach a source and start its worker thread.
    ///
    /// # Errors
    ///
    /// - `ClosedStream` after `close()`
    /// - the sticky error if a source already failed
    /// - `Finished` if a reader already got end of stream
    /// - `WorkerSpawn` if the thread could not be started
    pub fn attach_source<R>(&self, reader: R) -> Result<Handle>
    where
        R: Read + Send + 'static,
    {
        self.attach(None, Box::new(reader))
    }

    /// Like `attach_source()`, with a name used in logs and errors
    pub fn attach_named_source<R>(&self, name: &str, reader: R) -> Result<Handle>
    where
        R: Read + Send + 'static,
    {
        self.attach(Some(name), Box::new(reader))
    }

    /// Attach several sources at once, stopping at the first failure
    pub fn attach_sources<I, R>(&self, readers: I) -> Result<Vec<Handle>>
    where
        I: IntoIterator<Item = R>,
        R: Read + Send + 'static,
    {
        readers
            .into_iter()
            .map(|reader| self.attach_source(reader))
            .collect()
    }

    fn attach(&self, name: Option<&str>, reader: Box<dyn Read + Send>) -> Result<Handle> {
        let handle = self.shared.handles.next_handle();
        let name = name.map_or_else(|| format!("source-{}", handle.id()), str::to_string);
        let chunk_size = self.shared.options.read().chunk_size;

        // The lock is held across the spawn: the new worker blocks on it in
        // `mark_reading` until the source is registered.
        let mut state = self.shared.state.lock();
        if !state.status.accepts_attach() {
            return Err(match state.status {
                EngineStatus::Errored => state.error.clone().unwrap_or(FanError::ClosedStream),
                EngineStatus::Finished => FanError::Finished,
                _ => FanError::ClosedStream,
            });
        }

        let previous_status = state.status;
        if previous_status == EngineStatus::Draining {
            // Earlier sources are done but a reader has not seen the end yet
            self.shared.queue.reopen();
            debug!(source = %handle, "source attached while draining, queue reopened");
        }
        state.sources.push(SourceInfo {
            handle,
            name: name.clone(),
            state: SourceState::Attached,
            failure: None,
        });
        state.active += 1;
        state.status = EngineStatus::Running;

        let worker = SourceWorker {
            handle,
            name: name.clone(),
            reader,
            chunk_size,
            shared: Arc::clone(&self.shared),
        };
        let spawned = thread::Builder::new()
            .name(format!("fanin-src-{}", handle.id()))
            .spawn(move || worker.run());

        if let Err(e) = spawned {
            state.sources.retain(|s| s.handle != handle);
            state.active -= 1;
            state.status = previous_status;
            if previous_status == EngineStatus::Draining {
                self.shared.queue.close();
            }
            warn!(source = %handle, error = %e, "failed to spawn source worker");
            return Err(FanError::WorkerSpawn(Arc::new(e)));
        }

        debug!(source = %handle, %name, chunk_size, active = state.active, "source attached");
        Ok(handle)
    }

    /// Read merged bytes into `buf`.
    ///
    /// Blocks until data is available. Returns `Ok(0)` at end of stream:
    /// every source finished and every chunk was consumed.
    ///
    /// # Errors
    ///
    /// - the sticky source error, as soon as any source failed, even if
    ///   unread chunks remain
    /// - `ClosedStream` after `close()`
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(buf, None)
    }

    /// Like `read()`, but fails with `TimedOut` if nothing arrives in time
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_inner(buf, Some((Instant::now() + timeout, timeout)))
    }

    /// Read a single byte; `Ok(None)` at end of stream
    pub fn read_byte(&self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn read_inner(&self, buf: &mut [u8], deadline: Option<(Instant, Duration)>) -> Result<usize> {
        let mut pending = self.pending.lock();
        loop {
            self.shared.check_readable()?;

            if buf.is_empty() {
                return Ok(0);
            }
            if let Some(p) = pending.as_mut() {
                let n = p.copy_to(buf);
                if p.is_consumed() {
                    *pending = None;
                }
                return Ok(n);
            }

            let popped = match deadline {
                None => self.shared.queue.pop(),
                Some((deadline, _)) => self.shared.queue.pop_until(deadline),
            };
            match popped {
                Pop::Chunk(chunk) => *pending = Some(Pending { chunk, pos: 0 }),
                Pop::Drained => {
                    if self.shared.mark_drained() {
                        return Ok(0);
                    }
                }
                Pop::Interrupted => {
                    // Interrupts come from a source failure or `close()`
                    self.shared.check_readable()?;
                    return Err(FanError::QueueInterrupted);
                }
                Pop::TimedOut => {
                    let timeout = deadline.map_or(Duration::ZERO, |(_, timeout)| timeout);
                    return Err(FanError::TimedOut(timeout));
                }
            }
        }
    }

    /// Stop all sources and end the stream.
    ///
    /// Idempotent. Readers blocked in `read()` wake up with `ClosedStream`.
    /// Workers stop after their current read and drop their source; a worker
    /// parked inside a blocking read is not waited for.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.status == EngineStatus::Closed {
                return;
            }
            info!(
                previous = %state.status,
                active = state.active,
                "closing fan-in"
            );
            state.status = EngineStatus::Closed;
        }
        self.shared.queue.interrupt();
        self.shared.queue.close();
    }

    /// Current aggregate state, without blocking on data.
    ///
    /// `Draining` lasts until a reader has taken every byte and got end of
    /// stream; only then the status is `Finished`.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.shared.state.lock().status
    }

    /// The sticky error, if a source failed
    #[must_use]
    pub fn error(&self) -> Option<FanError> {
        self.shared.state.lock().error.clone()
    }

    /// Snapshot of every source attached so far
    #[must_use]
    pub fn sources(&self) -> Vec<SourceInfo> {
        self.shared.state.lock().sources.clone()
    }

    /// Chunks pushed by sources and not yet taken by a reader
    #[must_use]
    pub fn queued_chunks(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Default for FanIn {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for FanIn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FanIn::read(self, buf).map_err(io::Error::from)
    }
}

impl Read for &FanIn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FanIn::read(*self, buf).map_err(io::Error::from)
    }
}

impl fmt::Debug for FanIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        write!(
            f,
            "FanIn(status={}, sources={}, active={}, queue={:?})",
            state.status,
            state.sources.len(),
            state.active,
            self.shared.queue
        )
    }
}

impl Drop for FanIn {
    fn drop(&mut self) {
        self.close();
    }
}
