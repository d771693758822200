//! Transient numeric buffer accounting.
//!
//! Every intermediate tensor built while preparing a face tile is wrapped in a
//! [`TrackedBuffer`]. The tracker counts live buffers so a long-running capture
//! loop can assert that nothing survives a cycle.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    peak: AtomicUsize,
    allocated: AtomicU64,
}

/// Cloneable handle to a shared set of buffer counters.
#[derive(Debug, Clone, Default)]
pub struct BufferTracker {
    counters: Arc<Counters>,
}

impl BufferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `value` as a tracked transient buffer.
    pub fn track<T>(&self, value: T) -> TrackedBuffer<T> {
        let live = self.counters.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(live, Ordering::AcqRel);
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        TrackedBuffer {
            value,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Buffers currently alive.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously live buffers seen.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    /// Total buffers ever tracked.
    pub fn total_allocated(&self) -> u64 {
        self.counters.allocated.load(Ordering::Relaxed)
    }
}

/// A buffer whose lifetime is counted by a [`BufferTracker`]. Released on drop.
#[derive(Debug)]
pub struct TrackedBuffer<T> {
    value: T,
    counters: Arc<Counters>,
}

impl<T> Deref for TrackedBuffer<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for TrackedBuffer<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for TrackedBuffer<T> {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
    }
}
