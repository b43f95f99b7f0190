//! Waiter-id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// The reserved "no waiter" id. Cancelling it is always a no-op.
pub const NULL_ID: u64 = 0;

/// Per-primitive id allocator.
///
/// Ids are handed out synchronously, before the strand task that registers
/// the waiter runs, so a caller can cancel an operation it just initiated.
/// Ids start at 1; 0 is reserved. Wrap-around after 2^64 allocations is not
/// handled.
#[derive(Debug)]
pub struct IdSource {
    next: AtomicU64,
}

impl IdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let ids = IdSource::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, NULL_ID);
        assert_ne!(a, b);
        assert_eq!(b, a + 1);
    }
}
