use alloc::format;
use alloc::string::String;
use portable_atomic::{AtomicU64, Ordering};

use crate::blob::ObjectId;

/// Hands out process-unique [`ObjectId`]s.
#[derive(Debug, Default)]
pub struct ObjectIdAllocator {
    next: AtomicU64,
}

impl ObjectIdAllocator {
    /// Creates an allocator starting at id 0.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Returns a fresh id.
    pub fn allocate(&self) -> ObjectId {
        ObjectId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Generates unique names made of a prefix and a monotonically increasing counter.
///
/// The counter is shared by all prefixes, so two calls never return the same name.
#[derive(Debug, Default)]
pub struct UniqueNames {
    counter: AtomicU64,
}

impl UniqueNames {
    /// Creates a generator starting at 0.
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Returns `"{prefix}{n}"` for the next counter value.
    pub fn unique_str(&self, prefix: &str) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}{id}")
    }
}
