//! Identities for attached sources and destinations

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one attached source (fan-in) or destination (fan-out).
///
/// Handles are unique within the engine that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    id: u64,
}

impl Handle {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Thread-safe handle generator
#[derive(Debug)]
pub struct HandleGen {
    next_id: AtomicU64,
}

impl HandleGen {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next unique handle
    pub fn next_handle(&self) -> Handle {
        Handle::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_sequential_and_unique() {
        let ids = HandleGen::new();
        let a = ids.next_handle();
        let b = ids.next_handle();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        assert_eq!(Handle::new(7).to_string(), "#7");
    }
}
