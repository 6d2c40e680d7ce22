//! Usage statistics for arenas, pools and scratch contexts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of an arena's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Bytes handed out (the bump cursor).
    pub position: usize,
    /// Bytes backed by memory, header included.
    pub committed: usize,
    /// Usable bytes reserved.
    pub capacity: usize,
    /// Highest cursor value seen since creation.
    pub peak_position: usize,
    /// Number of times the arena committed more pages.
    pub commits: u64,
    /// Number of times the arena decommitted pages.
    pub decommits: u64,
}

/// Snapshot of a pool's slot accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Slots currently handed out.
    pub live: usize,
    /// Slots waiting on the free list.
    pub free: usize,
    /// Slots whose generation counter ran out; never reused.
    pub retired: usize,
    /// Allocations that pushed a new slot onto the arena.
    pub fresh: u64,
    /// Allocations served from the free list.
    pub reused: u64,
}

/// Snapshot of process-wide scratch context counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScratchStats {
    /// Contexts created since process start.
    pub created: u64,
    /// Contexts torn down since process start.
    pub destroyed: u64,
}

impl ScratchStats {
    /// Contexts still alive on some thread.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.destroyed)
    }
}

/// Atomic scratch counters for lock-free updates from any thread.
pub struct AtomicScratchStats {
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl AtomicScratchStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Take a snapshot of the counters.
    pub fn snapshot(&self) -> ScratchStats {
        ScratchStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Record a context creation.
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a context teardown.
    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for AtomicScratchStats {
    fn default() -> Self {
        Self::new()
    }
}
