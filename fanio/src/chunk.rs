//! Immutable unit of bytes moved through a queue

use std::fmt;
use std::sync::Arc;

use crate::handle::Handle;

/// One buffered unit of bytes.
///
/// Fan-in chunks carry the handle of the source that produced them. Fan-out
/// chunks carry none: the same chunk is shared by every destination queue,
/// and cloning it only bumps a reference count.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    origin: Option<Handle>,
    bytes: Arc<[u8]>,
}

impl Chunk {
    #[must_use]
    pub fn new(origin: Option<Handle>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            origin,
            bytes: bytes.into(),
        }
    }

    /// Source that produced this chunk (fan-in only)
    #[must_use]
    pub fn origin(&self) -> Option<Handle> {
        self.origin
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk(origin={:?}, len={})", self.origin, self.bytes.len())
    }
}
