//! Fan-in and fan-out byte stream multiplexing
//!
//! - [`FanIn`] merges any number of readers into one readable stream.
//! - [`FanOut`] broadcasts one written stream to any number of writers.
//!
//! Both engines run one worker thread per attached reader or writer and
//! decouple it from the caller through a [`ChunkQueue`].

pub mod buffer;
pub mod chunk;
pub mod error;
pub mod fan_in;
pub mod fan_out;
pub mod handle;
pub mod queue;
pub mod state;

pub use buffer::{BufferReadGuard, SharedBuffer};
pub use chunk::Chunk;
pub use error::{FanError, Result};
pub use fan_in::{ChunkFilter, FanIn, FanInOptions, SourceInfo, DEFAULT_CHUNK_SIZE};
pub use fan_out::{DestinationEvent, DestinationInfo, FanOut, EVENT_CHANNEL_CAPACITY};
pub use handle::{Handle, HandleGen};
pub use queue::{ChunkQueue, Pop};
pub use state::{DestinationState, EngineStatus, SourceState};
