//! # strata-memory
//!
//! Deterministic, low-overhead allocation for the `strata` base layer.
//!
//! Provides a virtual-memory-backed bump [`Arena`] with checkpoint rollback,
//! per-thread [`scratch`] arenas with conflict avoidance, and a generational
//! [`Pool`] of fixed-size slots built on top of an arena.
#![warn(missing_docs)]

pub mod arena;
pub mod config;
pub mod error;
pub mod pool;
pub mod scratch;
pub mod stats;

pub use arena::{Arena, ArenaCheckpoint, ArenaId, ARENA_HEADER_SIZE};
pub use config::MemoryConfig;
pub use error::MemoryError;
pub use pool::{Pool, PoolCursor, PoolHandle};
pub use scratch::Scratch;
pub use stats::{ArenaStats, PoolStats};

/// Log a fatal allocation failure and abort the process.
///
/// A bump allocator that fails mid-growth has no partial state to fall back
/// to, so the infallible entry points end here.
#[cold]
pub(crate) fn fatal(err: &MemoryError) -> ! {
    tracing::error!(error = %err, "unrecoverable memory failure, aborting");
    std::process::abort()
}
