//! Per-thread scratch arenas.
//!
//! Every thread lazily gets a [`ScratchContext`] of [`SCRATCH_ARENA_COUNT`]
//! large arenas. [`get`] hands one out as a [`Scratch`] guard that rewinds
//! the arena when released, so temporaries cost a pointer bump. The locks
//! around the arenas are only ever contended by [`teardown`].
//!
//! A function that receives a scratch arena from its caller and wants its
//! own temporaries passes the caller's arena as a conflict:
//!
//! ```
//! use strata_memory::scratch::{self, Scratch};
//!
//! fn build(out: &Scratch) -> usize {
//!     let tmp = scratch::get(&[out.id()]).unwrap();
//!     assert_ne!(tmp.id(), out.id());
//!     tmp.arena().push(128);
//!     out.arena().push(16)
//! }
//!
//! let out = scratch::get(&[]).unwrap();
//! build(&out);
//! ```
//!
//! Contexts end at thread exit, at [`teardown_thread`], or for every thread
//! at once at [`teardown`]. A thread whose context was torn down gets a new
//! one from its next [`get`].

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::arena::{Arena, ArenaCheckpoint, ArenaId};
use crate::config::{self, MemoryConfig};
use crate::error::MemoryError;
use crate::stats::{AtomicScratchStats, ScratchStats};

/// Scratch arenas per thread.
pub const SCRATCH_ARENA_COUNT: usize = 2;

static STATS: AtomicScratchStats = AtomicScratchStats::new();

/// Every context created and not yet dropped, for process-wide teardown.
static REGISTRY: Mutex<Vec<Weak<ScratchContext>>> = parking_lot::const_mutex(Vec::new());

thread_local! {
    static CONTEXT: RefCell<Option<Arc<ScratchContext>>> = const { RefCell::new(None) };
}

/// The scratch arenas owned by one thread.
///
/// Created by the first [`get`] on a thread. Its arenas are released when it
/// is revoked by a teardown or when the last reference to it goes away.
pub struct ScratchContext {
    owner: ThreadId,
    ids: [ArenaId; SCRATCH_ARENA_COUNT],
    arenas: [Mutex<Option<Arena>>; SCRATCH_ARENA_COUNT],
    revoked: AtomicBool,
}

impl ScratchContext {
    fn create(config: &MemoryConfig) -> Result<Arc<Self>, MemoryError> {
        let provider = config.provider();
        let first = Arena::try_with_provider(config.scratch_reserve, provider)?;
        let second = Arena::try_with_provider(config.scratch_reserve, provider)?;

        let context = Arc::new(Self {
            owner: thread::current().id(),
            ids: [first.id(), second.id()],
            arenas: [Mutex::new(Some(first)), Mutex::new(Some(second))],
            revoked: AtomicBool::new(false),
        });

        let mut registry = REGISTRY.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&context));
        drop(registry);

        STATS.record_created();
        tracing::debug!(
            thread = ?context.owner,
            reserve = config.scratch_reserve,
            "created scratch context"
        );
        Ok(context)
    }

    /// Whether a teardown has released this context's arenas.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// First arena that is neither listed in `conflicts` nor currently
    /// borrowed through another guard, with a checkpoint at its cursor.
    fn pick(&self, conflicts: &[ArenaId]) -> Option<(usize, ArenaId, ArenaCheckpoint)> {
        self.ids
            .iter()
            .zip(&self.arenas)
            .enumerate()
            .filter(|(_, (id, _))| !conflicts.contains(*id))
            .find_map(|(index, (&id, slot))| {
                let slot = slot.try_lock()?;
                slot.as_ref().map(|arena| (index, id, arena.checkpoint()))
            })
    }

    /// Release the arenas. Returns `false` if already revoked.
    fn revoke(&self) -> bool {
        if self.revoked.swap(true, Ordering::AcqRel) {
            return false;
        }
        for slot in &self.arenas {
            drop(slot.lock().take());
        }
        STATS.record_destroyed();
        tracing::debug!(thread = ?self.owner, "destroyed scratch context");
        true
    }
}

impl Drop for ScratchContext {
    fn drop(&mut self) {
        self.revoke();
    }
}

impl fmt::Debug for ScratchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchContext")
            .field("owner", &self.owner)
            .field("ids", &self.ids)
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

/// A scratch arena borrowed until the guard is released or dropped.
///
/// On release the arena is rewound to where it was when the guard was
/// created. Guards on the same arena must be released in LIFO order.
pub struct Scratch {
    id: ArenaId,
    index: usize,
    context: Arc<ScratchContext>,
    checkpoint: Option<ArenaCheckpoint>,
}

impl Scratch {
    /// Identity of the underlying arena, for use in conflict lists.
    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Borrow the arena.
    ///
    /// # Panics
    ///
    /// If the arena is already borrowed, or was released by a teardown
    /// while this guard was outstanding.
    pub fn arena(&self) -> MappedMutexGuard<'_, Arena> {
        let id = self.id;
        let slot = self.context.arenas[self.index]
            .try_lock()
            .unwrap_or_else(|| panic!("scratch {id} is already borrowed"));
        MutexGuard::try_map(slot, Option::as_mut)
            .unwrap_or_else(|_| panic!("scratch {id} was released by teardown"))
    }

    /// Rewind the arena and give it back. Same as dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let Some(checkpoint) = self.checkpoint.take() else {
            return;
        };
        match self.context.arenas[self.index].try_lock() {
            Some(mut slot) => {
                if let Some(arena) = slot.as_mut() {
                    arena.restore(checkpoint);
                }
            }
            None => tracing::warn!(id = %self.id, "scratch arena still borrowed on release"),
        }
    }
}

impl fmt::Debug for Scratch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratch")
            .field("id", &self.id)
            .field("checkpoint", &self.checkpoint)
            .finish_non_exhaustive()
    }
}

/// Borrow a scratch arena of the calling thread that is not in `conflicts`.
///
/// Creates the thread's context on first use, or after a teardown, sized by
/// [`config::current`]. Every arena in the context is compared against every
/// entry of `conflicts`.
///
/// # Errors
///
/// [`MemoryError::ScratchExhausted`] when every scratch arena conflicts or is
/// borrowed, and [`MemoryError::Vm`] when the context cannot be created.
pub fn get(conflicts: &[ArenaId]) -> Result<Scratch, MemoryError> {
    let context = CONTEXT.with(|cell| -> Result<_, MemoryError> {
        let mut slot = cell.borrow_mut();
        if let Some(context) = slot.as_ref().filter(|context| !context.is_revoked()) {
            return Ok(Arc::clone(context));
        }
        let context = ScratchContext::create(&config::current())?;
        *slot = Some(Arc::clone(&context));
        Ok(context)
    })?;

    let exhausted = MemoryError::ScratchExhausted {
        available: SCRATCH_ARENA_COUNT,
    };
    let (index, id, checkpoint) = context.pick(conflicts).ok_or(exhausted)?;
    Ok(Scratch {
        id,
        index,
        context,
        checkpoint: Some(checkpoint),
    })
}

/// Give a scratch arena back, rewinding it.
pub fn release(scratch: Scratch) {
    scratch.release();
}

/// Release the scratch arenas of every thread.
///
/// Guards still outstanding anywhere lose their arena; their owning threads
/// get fresh contexts on their next [`get`]. Returns the number of contexts
/// released.
pub fn teardown() -> usize {
    let contexts: Vec<_> = REGISTRY
        .lock()
        .drain(..)
        .filter_map(|weak| weak.upgrade())
        .collect();
    let released = contexts.iter().filter(|context| context.revoke()).count();
    drop(contexts);
    teardown_thread();
    tracing::debug!(released, "tore down scratch contexts");
    released
}

/// Release the calling thread's scratch arenas now.
pub fn teardown_thread() {
    let context = CONTEXT.try_with(|cell| cell.borrow_mut().take()).ok().flatten();
    if let Some(context) = context {
        context.revoke();
    }
}

/// Whether the calling thread has a live scratch context.
#[must_use]
pub fn is_initialized() -> bool {
    CONTEXT
        .try_with(|cell| cell.borrow().as_ref().is_some_and(|c| !c.is_revoked()))
        .unwrap_or(false)
}

/// Process-wide scratch context counters.
#[must_use]
pub fn stats() -> ScratchStats {
    STATS.snapshot()
}

/// Scratch contexts alive on any thread.
#[must_use]
pub fn live_contexts() -> u64 {
    STATS.snapshot().live()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;

    // Process-wide teardown would pull arenas out from under tests running
    // in parallel, so those tests take the lock exclusively.
    static TEARDOWN_LOCK: RwLock<()> = parking_lot::const_rwlock(());

    fn shared() -> RwLockReadGuard<'static, ()> {
        TEARDOWN_LOCK.read()
    }

    fn exclusive() -> RwLockWriteGuard<'static, ()> {
        TEARDOWN_LOCK.write()
    }

    #[test]
    fn two_requests_get_distinct_arenas() {
        let _lock = shared();
        let first = get(&[]).unwrap();
        let second = get(&[first.id()]).unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn third_conflicting_request_does_not_alias() {
        let _lock = shared();
        let first = get(&[]).unwrap();
        let second = get(&[first.id()]).unwrap();
        let err = get(&[first.id(), second.id()]).unwrap_err();
        assert!(matches!(err, MemoryError::ScratchExhausted { available: 2 }));
    }

    #[test]
    fn conflicts_are_matched_in_any_position() {
        let _lock = shared();
        let first = get(&[]).unwrap();
        let unrelated = Arena::try_with_provider(1024, strata_vm::heap_provider()).unwrap();
        let second = get(&[unrelated.id(), first.id()]).unwrap();
        assert_ne!(second.id(), first.id());
    }

    #[test]
    fn release_rewinds_the_arena() {
        let _lock = shared();
        let scratch = get(&[]).unwrap();
        let id = scratch.id();
        let start = scratch.arena().pos();
        scratch.arena().push(4096);
        assert_eq!(scratch.arena().pos(), start + 4096);
        release(scratch);

        let again = get(&[]).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.arena().pos(), start);
    }

    #[test]
    fn nested_guards_on_one_arena_unwind() {
        let _lock = shared();
        let outer = get(&[]).unwrap();
        outer.arena().push(10);
        let id = outer.id();
        {
            let inner = get(&[]).unwrap();
            assert_eq!(inner.id(), id);
            inner.arena().push(20);
            assert_eq!(inner.arena().pos(), 30);
        }
        assert_eq!(outer.arena().pos(), 10);
    }

    #[test]
    fn borrowed_arena_is_skipped() {
        let _lock = shared();
        let first = get(&[]).unwrap();
        let held = first.arena();
        let second = get(&[]).unwrap();
        assert_ne!(second.id(), first.id());
        drop(held);
    }

    #[test]
    fn thread_teardown_recreates_context() {
        let _lock = shared();
        let guard = get(&[]).unwrap();
        let old = guard.id();
        assert!(is_initialized());
        teardown_thread();
        assert!(!is_initialized());
        // Dropping a guard whose arena is gone is harmless.
        drop(guard);
        let fresh = get(&[]).unwrap();
        assert!(is_initialized());
        assert_ne!(fresh.id(), old);
        assert_eq!(fresh.arena().pos(), 0);
    }

    #[test]
    #[should_panic(expected = "released by teardown")]
    fn guard_outliving_teardown_panics_on_use() {
        let _lock = shared();
        let guard = get(&[]).unwrap();
        teardown_thread();
        guard.arena().push(8);
    }

    #[test]
    fn thread_exit_destroys_context() {
        let _lock = shared();
        let before = stats();
        std::thread::spawn(|| {
            let scratch = get(&[]).unwrap();
            scratch.arena().push(64);
        })
        .join()
        .unwrap();
        let after = stats();
        assert!(after.created > before.created);
        assert!(after.destroyed > before.destroyed);
    }

    #[test]
    fn teardown_releases_other_threads_contexts() {
        let _lock = exclusive();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        let worker = std::thread::spawn(move || {
            let guard = get(&[]).unwrap();
            guard.arena().push(64);
            ready_tx.send(guard.id()).unwrap();
            resume_rx.recv().unwrap();

            assert!(!is_initialized());
            let used = panic::catch_unwind(AssertUnwindSafe(|| guard.arena().pos()));
            assert!(used.is_err());
            drop(guard);

            let fresh = get(&[]).unwrap();
            assert!(is_initialized());
            fresh.id()
        });

        let old = ready_rx.recv().unwrap();
        assert!(live_contexts() >= 1);
        let released = teardown();
        assert!(released >= 1);
        assert_eq!(live_contexts(), 0);

        resume_tx.send(()).unwrap();
        let fresh = worker.join().unwrap();
        assert_ne!(fresh, old);
    }

    #[test]
    fn teardown_twice_releases_nothing_new() {
        let _lock = exclusive();
        get(&[]).unwrap().arena().push(8);
        teardown();
        assert_eq!(teardown(), 0);
        assert!(!is_initialized());
    }

    #[test]
    fn debug_shows_id() {
        let _lock = shared();
        let scratch = get(&[]).unwrap();
        assert!(format!("{scratch:?}").contains("Scratch"));
    }
}
