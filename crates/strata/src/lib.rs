//! # strata
//!
//! Base layer for programs that want deterministic, low-overhead memory.
//!
//! ```
//! use strata::{runtime, scratch, Arena, Pool};
//!
//! runtime::init().unwrap();
//!
//! let mut arena = Arena::new(1 << 20);
//! let offset = arena.push_value(7u64);
//! assert_eq!(arena.read::<u64>(offset), 7);
//!
//! let mut pool = Pool::new(16, &mut arena);
//! let handle = pool.alloc();
//! assert!(pool.is_valid(handle));
//!
//! let tmp = scratch::get(&[]).unwrap();
//! tmp.arena().push(256);
//! tmp.release();
//!
//! runtime::shutdown();
//! ```

pub mod runtime;
pub mod version;

pub use strata_memory::{
    arena, config, pool, scratch, stats, Arena, ArenaCheckpoint, ArenaId, ArenaStats,
    MemoryConfig, MemoryError, Pool, PoolCursor, PoolHandle, PoolStats, Scratch,
    ARENA_HEADER_SIZE,
};
pub use strata_vm::{HeapVm, OsVm, Region, VmError, VmProvider};

pub use runtime::Platform;
