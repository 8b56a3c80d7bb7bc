use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

struct Slot<T> {
    value: RwLock<T>,
    /// Bumped on every successful publish.
    version: AtomicU64,
    /// Publishes dropped by `try_store` because a reader held the slot.
    dropped: AtomicU64,
}

/// Single-writer cell holding one complete value.  Writers replace it whole,
/// readers get a copy; nobody sees a half-written value.
pub struct Latest<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Default> Default for Latest<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Latest<T> {
    pub fn new(initial: T) -> Self {
        Self {
            slot: Arc::new(Slot {
                value: RwLock::new(initial),
                version: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the value, waiting for in-flight readers to finish copying.
    ///
    /// Only for non-realtime writers.  Readers hold the lock just long enough
    /// to clone, so the wait is bounded by one copy.
    pub fn store(&self, value: T) {
        *self.slot.value.write() = value;
        self.slot.version.fetch_add(1, Ordering::Release);
    }

    /// Replace the value only if the slot is free right now.
    ///
    /// Never blocks.  Returns false (and counts a drop) when a reader is
    /// copying at this instant; the next block will publish again.
    pub fn try_store(&self, value: T) -> bool {
        match self.slot.value.try_write() {
            Some(mut guard) => {
                *guard = value;
                drop(guard);
                self.slot.version.fetch_add(1, Ordering::Release);
                true
            }
            None => {
                self.slot.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn version(&self) -> u64 {
        self.slot.version.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Latest<T> {
    pub fn load(&self) -> T {
        self.slot.value.read().clone()
    }
}
