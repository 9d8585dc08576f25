//! Shared in-memory byte buffer
//!
//! A sink that can be handed to `FanOut` while the caller keeps a clone to
//! look at what arrived.

use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::ops::Deref;
use std::sync::Arc;

/// Read-only guard to buffer contents
///
/// Holds the lock and provides read-only access to the underlying data.
/// The lock is released when the guard is dropped.
pub struct BufferReadGuard<'a>(MutexGuard<'a, Vec<u8>>);

impl Deref for BufferReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for BufferReadGuard<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Growable byte buffer backed by `Arc<Mutex<Vec<u8>>>`.
///
/// Clones share the same bytes, so one clone can be moved into a destination
/// worker and another kept for inspection.
///
/// # Example
///
/// ```
/// use fanio::SharedBuffer;
/// use std::io::Write;
///
/// let buffer = SharedBuffer::new();
/// let mut sink = buffer.clone();
/// sink.write_all(b"hello").unwrap();
///
/// assert_eq!(&*buffer.lock(), b"hello");
/// ```
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        self.0.lock().extend_from_slice(data);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Copy of the current contents
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Lock the buffer for reading without copying
    #[must_use]
    pub fn lock(&self) -> BufferReadGuard<'_> {
        BufferReadGuard(self.0.lock())
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBuffer(len={})", self.len())
    }
}
