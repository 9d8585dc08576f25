//! Error type shared by both engines

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::handle::Handle;

/// Error type for fan-in and fan-out operations
///
/// Clonable: the fan-in engine keeps the first source failure as a sticky
/// error and hands a copy to every subsequent `read()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FanError {
    #[error("source {source_id} ({name}) read failed: {cause}")]
    SourceRead {
        source_id: Handle,
        name: String,
        #[source]
        cause: Arc<io::Error>,
    },

    #[error("destination {destination} ({name}) write failed: {cause}")]
    SinkWrite {
        destination: Handle,
        name: String,
        #[source]
        cause: Arc<io::Error>,
    },

    #[error("stream is closed")]
    ClosedStream,

    #[error("queue wait interrupted by shutdown")]
    QueueInterrupted,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("stream has finished, no more sources can be attached")]
    Finished,

    #[error("unknown destination {0}")]
    UnknownDestination(Handle),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] Arc<io::Error>),
}

impl FanError {
    /// The I/O failure behind a source or sink error, if any
    #[must_use]
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            Self::SourceRead { cause, .. }
            | Self::SinkWrite { cause, .. }
            | Self::WorkerSpawn(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<FanError> for io::Error {
    fn from(e: FanError) -> Self {
        let kind = match &e {
            FanError::ClosedStream | FanError::Finished => io::ErrorKind::BrokenPipe,
            FanError::QueueInterrupted => io::ErrorKind::Interrupted,
            FanError::TimedOut(_) => io::ErrorKind::TimedOut,
            FanError::UnknownDestination(_) => io::ErrorKind::NotFound,
            FanError::SourceRead { cause, .. }
            | FanError::SinkWrite { cause, .. }
            | FanError::WorkerSpawn(cause) => cause.kind(),
        };
        io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, FanError>;
