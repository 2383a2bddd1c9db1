//! Monotonic request id allocation

use std::sync::atomic::{AtomicI64, Ordering};

use crate::types::RequestId;

/// Hands out strictly increasing request ids.
///
/// The counter is the only state shared between concurrent allocators, so a
/// single atomic is enough.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    pub fn new(first: RequestId) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    pub fn allocate(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure the next id is at least `floor`. Never moves backwards.
    pub fn raise_floor(&self, floor: RequestId) {
        self.next.fetch_max(floor, Ordering::SeqCst);
    }

    /// Id the next call to `allocate` will return
    pub fn peek(&self) -> RequestId {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}
