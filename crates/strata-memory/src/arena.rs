//! Virtual-memory bump arena.
//!
//! An [`Arena`] reserves its whole capacity up front and commits pages on
//! demand as the cursor advances. Allocations are byte offsets from the
//! arena base; the base never moves, so offsets stay valid (and translate to
//! stable addresses through [`Arena::get_index`]) for the arena's whole life.
//!
//! Memory is only ever given back in stack order: [`Arena::pop`] and
//! [`Arena::clear`] decommit trailing pages, [`Arena::restore`] rewinds the
//! cursor to a checkpoint.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use strata_vm::page::round_up;
use strata_vm::{Region, VmError, VmProvider};

use crate::config::MemoryConfig;
use crate::error::MemoryError;
use crate::stats::ArenaStats;

/// Bytes at the start of every reservation taken by the arena header.
/// Counted in [`Arena::committed`], not in [`Arena::pos`].
pub const ARENA_HEADER_SIZE: usize = 64;

const ARENA_MAGIC: u64 = u64::from_le_bytes(*b"STRATARN");

/// Written at the start of the reservation; user bytes start right after.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ArenaHeader {
    magic: u64,
    id: u64,
    capacity: u64,
    reserved: [u64; 5],
}

const _: () = assert!(size_of::<ArenaHeader>() == ARENA_HEADER_SIZE);

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArenaId(u64);

impl ArenaId {
    fn next() -> Self {
        Self(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena#{}", self.0)
    }
}

/// A saved cursor position, consumed by [`Arena::restore`].
///
/// Checkpoints on one arena must be restored in LIFO order.
#[must_use = "a checkpoint does nothing unless handed back to `Arena::restore`"]
#[derive(Debug, PartialEq, Eq)]
pub struct ArenaCheckpoint {
    arena: ArenaId,
    position: usize,
}

impl ArenaCheckpoint {
    /// Arena the checkpoint was taken on.
    #[must_use]
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// Cursor value the arena will be rewound to.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Linear allocator over one virtual-memory reservation.
///
/// Invariant: `pos() + ARENA_HEADER_SIZE <= committed() <= capacity() + ARENA_HEADER_SIZE`,
/// with `committed()` a whole number of pages and never below one page.
pub struct Arena {
    id: ArenaId,
    region: Region,
    position: usize,
    peak_position: usize,
    commits: u64,
    decommits: u64,
}

impl Arena {
    /// Create an arena of at least `capacity` bytes over OS virtual memory.
    ///
    /// Aborts the process if the reservation fails.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_provider(capacity, strata_vm::os_provider())
    }

    /// Create an arena over OS virtual memory, reporting failure.
    pub fn try_new(capacity: usize) -> Result<Self, MemoryError> {
        Self::try_with_provider(capacity, strata_vm::os_provider())
    }

    /// Create an arena sized and backed as `config` says.
    ///
    /// Aborts the process if the reservation fails.
    #[must_use]
    pub fn with_config(config: &MemoryConfig) -> Self {
        Self::with_provider(config.default_arena_capacity, config.provider())
    }

    /// Create an arena over `provider`.
    ///
    /// Aborts the process if the reservation fails.
    #[must_use]
    pub fn with_provider(capacity: usize, provider: &'static dyn VmProvider) -> Self {
        match Self::try_with_provider(capacity, provider) {
            Ok(arena) => arena,
            Err(err) => crate::fatal(&err),
        }
    }

    /// Create an arena over `provider`, reporting failure.
    ///
    /// `capacity + ARENA_HEADER_SIZE` is rounded up to whole pages and
    /// reserved; exactly one page is committed.
    pub fn try_with_provider(
        capacity: usize,
        provider: &'static dyn VmProvider,
    ) -> Result<Self, MemoryError> {
        let page_size = provider.page_size();
        let total = capacity
            .checked_add(ARENA_HEADER_SIZE)
            .and_then(|total| round_up(total, page_size))
            .ok_or(VmError::SizeOverflow(capacity))?;

        let mut region = Region::reserve(provider, total)?;
        region.grow_to(page_size)?;

        let id = ArenaId::next();
        let usable = region.reserved() - ARENA_HEADER_SIZE;
        let header = ArenaHeader {
            magic: ARENA_MAGIC,
            id: id.get(),
            capacity: usable as u64,
            reserved: [0; 5],
        };
        region.as_mut_slice()[..ARENA_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

        tracing::debug!(%id, capacity = usable, page_size, "created arena");
        Ok(Self {
            id,
            region,
            position: 0,
            peak_position: 0,
            commits: 0,
            decommits: 0,
        })
    }

    /// Release the whole reservation. Same as dropping the arena.
    pub fn destroy(self) {
        drop(self);
    }

    /// Identity of this arena.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Current cursor: bytes handed out since creation or the last clear.
    #[inline]
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Bytes backed by memory, header included.
    #[inline]
    #[must_use]
    pub fn committed(&self) -> usize {
        self.region.committed()
    }

    /// Usable bytes reserved.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.reserved() - ARENA_HEADER_SIZE
    }

    /// Bytes that can still be pushed.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.position
    }

    /// Commit granularity.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.region.page_size()
    }

    /// Allocate `size` bytes and return their offset.
    ///
    /// The bytes are not cleared. Aborts the process if the arena is full or
    /// the OS refuses to commit.
    #[inline]
    pub fn push(&mut self, size: usize) -> usize {
        match self.try_push(size) {
            Ok(offset) => offset,
            Err(err) => crate::fatal(&err),
        }
    }

    /// Allocate `size` bytes, reporting failure instead of aborting.
    pub fn try_push(&mut self, size: usize) -> Result<usize, MemoryError> {
        if size == 0 {
            return Ok(self.position);
        }

        let capacity = self.capacity();
        let end = self
            .position
            .checked_add(size)
            .filter(|&end| end <= capacity)
            .ok_or(MemoryError::CapacityExceeded {
                requested: size,
                used: self.position,
                capacity,
            })?;

        let needed = ARENA_HEADER_SIZE + end;
        if needed > self.region.committed() {
            self.region.grow_to(needed)?;
            self.commits += 1;
        }

        let offset = self.position;
        self.position = end;
        self.peak_position = self.peak_position.max(end);
        Ok(offset)
    }

    /// Allocate `size` zeroed bytes and return their offset.
    pub fn push_zero(&mut self, size: usize) -> usize {
        match self.try_push_zero(size) {
            Ok(offset) => offset,
            Err(err) => crate::fatal(&err),
        }
    }

    /// Allocate `size` zeroed bytes, reporting failure instead of aborting.
    pub fn try_push_zero(&mut self, size: usize) -> Result<usize, MemoryError> {
        let offset = self.try_push(size)?;
        self.bytes_mut(offset, size).fill(0);
        Ok(offset)
    }

    /// Allocate `size` zeroed bytes and borrow them.
    pub fn alloc_bytes(&mut self, size: usize) -> &mut [u8] {
        let offset = self.push_zero(size);
        self.bytes_mut(offset, size)
    }

    /// Copy `value` into freshly pushed bytes and return their offset.
    pub fn push_value<T: Pod>(&mut self, value: T) -> usize {
        let offset = self.push(size_of::<T>());
        self.write(offset, value);
        offset
    }

    /// Read a `T` stored at `offset`. No alignment is required.
    #[must_use]
    pub fn read<T: Pod>(&self, offset: usize) -> T {
        bytemuck::pod_read_unaligned(self.bytes(offset, size_of::<T>()))
    }

    /// Store `value` at `offset`.
    pub fn write<T: Pod>(&mut self, offset: usize, value: T) {
        self.bytes_mut(offset, size_of::<T>())
            .copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Borrow `len` pushed bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// If the range is not committed.
    #[must_use]
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(
            offset + len <= self.position,
            "range {offset}..{} is past the cursor {}",
            offset + len,
            self.position
        );
        let start = ARENA_HEADER_SIZE + offset;
        &self.region.as_slice()[start..start + len]
    }

    /// Mutably borrow `len` pushed bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// If the range is not committed.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(
            offset + len <= self.position,
            "range {offset}..{} is past the cursor {}",
            offset + len,
            self.position
        );
        let start = ARENA_HEADER_SIZE + offset;
        &mut self.region.as_mut_slice()[start..start + len]
    }

    /// Address of the byte at `offset`.
    ///
    /// The address is stable for the arena's life, but only dereferenceable
    /// while `offset` is below the cursor.
    #[inline]
    #[must_use]
    pub fn get_index(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.position);
        self.region.ptr_at(ARENA_HEADER_SIZE + offset)
    }

    /// Give back the last `size` pushed bytes, decommitting pages the cursor
    /// no longer reaches. The first page always stays committed.
    pub fn pop(&mut self, size: usize) {
        debug_assert!(
            size <= self.position,
            "popped {size} bytes with only {} pushed",
            self.position
        );
        self.position -= size;
        self.decommit_unreached();
    }

    /// Drop every allocation and decommit everything past the first page.
    pub fn clear(&mut self) {
        self.position = 0;
        self.decommit_unreached();
    }

    fn decommit_unreached(&mut self) {
        let floor = (ARENA_HEADER_SIZE + self.position).max(self.region.page_size());
        if self.region.shrink_to(floor) > 0 {
            self.decommits += 1;
        }
    }

    /// Save the cursor.
    pub fn checkpoint(&self) -> ArenaCheckpoint {
        ArenaCheckpoint {
            arena: self.id,
            position: self.position,
        }
    }

    /// Rewind the cursor to `checkpoint`.
    ///
    /// Only the cursor moves; pages committed since the checkpoint stay
    /// committed until a later [`Arena::pop`] or [`Arena::clear`].
    pub fn restore(&mut self, checkpoint: ArenaCheckpoint) {
        debug_assert_eq!(
            checkpoint.arena, self.id,
            "checkpoint taken on {} restored on {}",
            checkpoint.arena, self.id
        );
        debug_assert!(
            checkpoint.position <= self.position,
            "checkpoint at {} restored with cursor at {}: checkpoints out of order",
            checkpoint.position,
            self.position
        );
        self.position = checkpoint.position.min(self.position);
    }

    /// Run `f` and rewind everything it pushed.
    pub fn scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let checkpoint = self.checkpoint();
        let result = f(self);
        self.restore(checkpoint);
        result
    }

    /// Snapshot of the arena's accounting.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            position: self.position,
            committed: self.committed(),
            capacity: self.capacity(),
            peak_position: self.peak_position,
            commits: self.commits,
            decommits: self.decommits,
        }
    }

    fn header(&self) -> ArenaHeader {
        bytemuck::pod_read_unaligned(&self.region.as_slice()[..ARENA_HEADER_SIZE])
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let header = self.header();
        debug_assert!(
            header.magic == ARENA_MAGIC && header.id == self.id.get(),
            "arena header of {} was overwritten",
            self.id
        );
        tracing::debug!(
            id = %self.id,
            peak = self.peak_position,
            commits = self.commits,
            "destroyed arena"
        );
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("committed", &self.committed())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_vm::HeapVm;

    static SMALL_PAGES: HeapVm = HeapVm::with_page_size(256);

    fn small_arena(capacity: usize) -> Arena {
        Arena::try_with_provider(capacity, &SMALL_PAGES).unwrap()
    }

    #[test]
    fn create_commits_one_page() {
        let arena = small_arena(4000);
        assert_eq!(arena.pos(), 0);
        assert_eq!(arena.committed(), 256);
        // 4000 + 64 rounded up to 256-byte pages.
        assert_eq!(arena.capacity(), 4096 - ARENA_HEADER_SIZE);
        assert_eq!(arena.remaining(), arena.capacity());
    }

    #[test]
    fn ids_are_unique() {
        let a = small_arena(100);
        let b = small_arena(100);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("arena#"));
    }

    #[test]
    fn push_returns_consecutive_offsets() {
        let mut arena = small_arena(4096);
        assert_eq!(arena.push(10), 0);
        assert_eq!(arena.push(20), 10);
        assert_eq!(arena.pos(), 30);
    }

    #[test]
    fn zero_sized_push_is_a_noop() {
        let mut arena = small_arena(4096);
        arena.push(5);
        let committed = arena.committed();
        assert_eq!(arena.push(0), 5);
        assert_eq!(arena.pos(), 5);
        assert_eq!(arena.committed(), committed);
    }

    #[test]
    fn push_commits_only_when_needed() {
        let mut arena = small_arena(4096);
        // Header plus 192 bytes fills exactly one page.
        arena.push(192);
        assert_eq!(arena.committed(), 256);
        arena.push(1);
        assert_eq!(arena.committed(), 512);
        arena.push(600);
        assert_eq!(arena.committed(), 1024);
        assert_eq!(arena.stats().commits, 2);
    }

    #[test]
    fn push_past_capacity_fails() {
        let mut arena = small_arena(192);
        assert_eq!(arena.capacity(), 192);
        arena.try_push(100).unwrap();
        let err = arena.try_push(93).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::CapacityExceeded {
                requested: 93,
                used: 100,
                capacity: 192
            }
        ));
        assert_eq!(arena.pos(), 100);
        assert_eq!(arena.try_push(92).unwrap(), 100);
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn push_overflowing_usize_fails() {
        let mut arena = small_arena(256);
        arena.push(1);
        assert!(arena.try_push(usize::MAX).is_err());
    }

    #[test]
    fn push_zero_clears_reused_bytes() {
        let mut arena = small_arena(4096);
        let offset = arena.push(16);
        arena.bytes_mut(offset, 16).fill(0xFF);
        arena.pop(16);
        let again = arena.push_zero(16);
        assert_eq!(again, offset);
        assert!(arena.bytes(again, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_bytes_is_writable() {
        let mut arena = small_arena(4096);
        let bytes = arena.alloc_bytes(4);
        bytes.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(arena.bytes(0, 4), &[1, 2, 3, 4]);
    }

    #[test]
    fn typed_values_roundtrip_unaligned() {
        let mut arena = small_arena(4096);
        arena.push(3);
        let at = arena.push_value(0x0102_0304_0506_0708_u64);
        assert_eq!(at, 3);
        assert_eq!(arena.read::<u64>(at), 0x0102_0304_0506_0708);
        arena.write(at, 7u64);
        assert_eq!(arena.read::<u64>(at), 7);
    }

    #[test]
    fn allocations_do_not_alias() {
        let mut arena = small_arena(1 << 16);
        let a = arena.push(100);
        arena.bytes_mut(a, 100).fill(0xAA);
        let b = arena.push(100);
        arena.bytes_mut(b, 100).fill(0xBB);
        assert!(arena.bytes(a, 100).iter().all(|&x| x == 0xAA));
        assert!(arena.bytes(b, 100).iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn pop_decommits_trailing_pages() {
        let mut arena = small_arena(4096);
        arena.push(1000);
        assert_eq!(arena.committed(), 1280);
        arena.pop(500);
        // Header + 500 bytes still reaches into the third page.
        assert_eq!(arena.committed(), 768);
        arena.pop(500);
        assert_eq!(arena.committed(), 256);
        assert_eq!(arena.pos(), 0);
        assert_eq!(arena.stats().decommits, 2);
    }

    #[test]
    fn pop_on_page_boundary_releases_page() {
        let mut arena = small_arena(4096);
        arena.push(192);
        arena.push(256);
        assert_eq!(arena.committed(), 512);
        arena.pop(256);
        assert_eq!(arena.committed(), 256);
    }

    #[test]
    #[should_panic(expected = "popped")]
    #[cfg(debug_assertions)]
    fn pop_more_than_pushed_asserts() {
        let mut arena = small_arena(4096);
        arena.push(8);
        arena.pop(9);
    }

    #[test]
    fn clear_keeps_one_page() {
        let mut arena = small_arena(1 << 14);
        arena.push(10 * 256 - ARENA_HEADER_SIZE);
        assert_eq!(arena.committed(), 10 * 256);
        arena.clear();
        assert_eq!(arena.committed(), 256);
        assert_eq!(arena.pos(), 0);
        arena.push(256);
        assert_eq!(arena.committed(), 512);
    }

    #[test]
    fn checkpoint_rewinds_cursor_only() {
        let mut arena = small_arena(1 << 14);
        arena.push(10);
        let checkpoint = arena.checkpoint();
        assert_eq!(checkpoint.position(), 10);
        assert_eq!(checkpoint.arena(), arena.id());
        arena.push(3000);
        let committed = arena.committed();
        arena.restore(checkpoint);
        assert_eq!(arena.pos(), 10);
        assert_eq!(arena.committed(), committed);
        // The next real pop trims the pages left behind.
        arena.pop(10);
        assert_eq!(arena.committed(), 256);
    }

    #[test]
    fn nested_checkpoints_restore_in_lifo_order() {
        let mut arena = small_arena(1 << 14);
        let outer = arena.checkpoint();
        arena.push(100);
        let inner = arena.checkpoint();
        arena.push(200);
        arena.restore(inner);
        assert_eq!(arena.pos(), 100);
        arena.restore(outer);
        assert_eq!(arena.pos(), 0);
    }

    #[test]
    #[should_panic(expected = "restored on")]
    #[cfg(debug_assertions)]
    fn foreign_checkpoint_asserts() {
        let a = small_arena(1024);
        let mut b = small_arena(1024);
        let checkpoint = a.checkpoint();
        b.restore(checkpoint);
    }

    #[test]
    fn scope_discards_pushes() {
        let mut arena = small_arena(1 << 14);
        arena.push(8);
        let sum = arena.scope(|arena| {
            let a = arena.push_value(3u32);
            let b = arena.push_value(4u32);
            arena.read::<u32>(a) + arena.read::<u32>(b)
        });
        assert_eq!(sum, 7);
        assert_eq!(arena.pos(), 8);
    }

    #[test]
    fn get_index_is_stable_across_growth() {
        let mut arena = Arena::new(1 << 20);
        let offset = arena.push(8);
        let before = arena.get_index(offset);
        arena.push(256 * 1024);
        assert_eq!(arena.get_index(offset), before);
        let next = arena.get_index(8);
        assert_eq!(next.as_ptr() as usize, before.as_ptr() as usize + 8);
    }

    #[test]
    fn os_backed_arena_grows_and_shrinks() {
        let mut arena = Arena::try_new(1 << 24).unwrap();
        let page = arena.page_size();
        assert_eq!(arena.committed(), page);
        let offset = arena.push(page * 3);
        arena.bytes_mut(offset, page * 3).fill(0x11);
        assert_eq!(arena.committed(), page * 4);
        arena.pop(page * 3);
        assert_eq!(arena.committed(), page);
    }

    #[test]
    fn stats_track_peak() {
        let mut arena = small_arena(4096);
        arena.push(300);
        arena.pop(200);
        arena.push(50);
        let stats = arena.stats();
        assert_eq!(stats.position, 150);
        assert_eq!(stats.peak_position, 300);
        assert_eq!(stats.capacity, arena.capacity());
    }

    #[test]
    fn with_config_uses_configured_capacity() {
        let config = MemoryConfig {
            default_arena_capacity: 1 << 20,
            use_heap_provider: true,
            ..MemoryConfig::default()
        };
        let arena = Arena::with_config(&config);
        assert!(arena.capacity() >= 1 << 20);
    }

    #[test]
    fn debug_output_names_fields() {
        let arena = small_arena(100);
        let text = format!("{arena:?}");
        assert!(text.contains("position"));
        assert!(text.contains("committed"));
    }
}
