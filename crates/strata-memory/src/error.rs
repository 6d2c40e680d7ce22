//! Memory-layer error types.

use strata_vm::VmError;

/// Errors from arenas, scratch arenas, pools and configuration.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The virtual-memory layer refused a reservation or commit.
    #[error(transparent)]
    Vm(#[from] VmError),

    /// An allocation does not fit in the arena's reservation.
    #[error("allocation of {requested} bytes exceeds arena capacity ({used} of {capacity} used)")]
    CapacityExceeded {
        /// Bytes requested.
        requested: usize,
        /// Bytes already in use.
        used: usize,
        /// Usable capacity of the arena.
        capacity: usize,
    },

    /// Every scratch arena of this thread is in the conflict list.
    #[error("all {available} scratch arenas conflict with the caller")]
    ScratchExhausted {
        /// Number of scratch arenas per thread.
        available: usize,
    },

    /// A pool ran out of slot numbers.
    #[error("pool has no slot numbers left")]
    PoolExhausted,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}
