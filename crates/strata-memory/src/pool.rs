//! Generational pool of fixed-size slots over an arena.
//!
//! Slots are pushed onto the borrowed [`Arena`] on demand and never given
//! back to it; freed slots go on a free list and are reused first. Each
//! slot block in the arena is a 4-byte tag holding the slot number, followed
//! by the payload. Links and generations live in a side table indexed by
//! slot number.
//!
//! A [`PoolHandle`] names a slot by its byte offset in the arena and the
//! generation it was handed out with. Freeing a slot bumps its generation,
//! so every handle to the old occupant stops validating.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;

use crate::arena::Arena;
use crate::error::MemoryError;
use crate::stats::PoolStats;

const SLOT_TAG_SIZE: usize = size_of::<u32>();

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

/// Weak, validity-checked reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    pool: u32,
    generation: u32,
    index: usize,
}

impl PoolHandle {
    /// A handle that never refers to any slot.
    pub const INVALID: Self = Self {
        pool: u32::MAX,
        generation: u32::MAX,
        index: usize::MAX,
    };

    /// Byte offset of the slot within the arena. Stable for the arena's life.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Whether this is [`PoolHandle::INVALID`].
    #[inline]
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.pool == u32::MAX
    }
}

impl Default for PoolHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Live,
    Free,
    /// Generation counter exhausted; the slot is never handed out again.
    Retired,
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    index: usize,
    generation: u32,
    next: Option<u32>,
    prev: Option<u32>,
    state: SlotState,
}

/// Fixed-size slot allocator over a borrowed arena.
pub struct Pool<'a> {
    arena: &'a mut Arena,
    id: u32,
    slot_size: usize,
    slots: Vec<SlotMeta>,
    free_head: Option<u32>,
    used_head: Option<u32>,
    used_tail: Option<u32>,
    live: usize,
    free: usize,
    retired: usize,
    fresh: u64,
    reused: u64,
}

impl<'a> Pool<'a> {
    /// Create an empty pool of `slot_size`-byte slots on `arena`.
    pub fn new(slot_size: usize, arena: &'a mut Arena) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed) % u32::MAX;
        tracing::debug!(pool = id, slot_size, arena = %arena.id(), "created pool");
        Self {
            arena,
            id,
            slot_size,
            slots: Vec::new(),
            free_head: None,
            used_head: None,
            used_tail: None,
            live: 0,
            free: 0,
            retired: 0,
            fresh: 0,
            reused: 0,
        }
    }

    /// Payload size of every slot.
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of live slots.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Whether no slot is live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// The arena the pool allocates from.
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &*self.arena
    }

    /// The arena the pool allocates from, for unrelated allocations.
    ///
    /// Popping or rewinding below a slot the pool handed out breaks the pool.
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut *self.arena
    }

    /// Allocate a zeroed slot. Aborts the process if the arena is exhausted.
    pub fn alloc(&mut self) -> PoolHandle {
        match self.try_alloc() {
            Ok(handle) => handle,
            Err(err) => crate::fatal(&err),
        }
    }

    /// Allocate a zeroed slot, reusing the most recently freed one if any.
    pub fn try_alloc(&mut self) -> Result<PoolHandle, MemoryError> {
        let slot = if let Some(slot) = self.free_head {
            let meta = &mut self.slots[slot as usize];
            self.free_head = meta.next;
            self.free -= 1;
            self.reused += 1;
            self.arena.bytes_mut(meta.index + SLOT_TAG_SIZE, self.slot_size).fill(0);
            slot
        } else {
            let slot = u32::try_from(self.slots.len())
                .ok()
                .filter(|&slot| slot != u32::MAX)
                .ok_or(MemoryError::PoolExhausted)?;
            let index = self.arena.try_push_zero(SLOT_TAG_SIZE + self.slot_size)?;
            self.arena.write(index, slot.to_le_bytes());
            self.slots.push(SlotMeta {
                index,
                generation: 0,
                next: None,
                prev: None,
                state: SlotState::Free,
            });
            self.fresh += 1;
            slot
        };

        self.link_front(slot);
        self.live += 1;
        let meta = &mut self.slots[slot as usize];
        meta.state = SlotState::Live;
        Ok(PoolHandle {
            pool: self.id,
            generation: meta.generation,
            index: meta.index,
        })
    }

    /// Free the slot `handle` refers to.
    ///
    /// Returns `false`, changing nothing, if the handle is stale or invalid.
    pub fn free(&mut self, handle: PoolHandle) -> bool {
        let Some(slot) = self.resolve_live(handle) else {
            return false;
        };

        self.unlink(slot);
        self.live -= 1;

        let meta = &mut self.slots[slot as usize];
        meta.generation += 1;
        if meta.generation == u32::MAX {
            meta.state = SlotState::Retired;
            self.retired += 1;
            tracing::debug!(
                pool = self.id,
                index = meta.index,
                "retired slot with exhausted generation"
            );
        } else {
            meta.state = SlotState::Free;
            meta.next = self.free_head;
            self.free_head = Some(slot);
            self.free += 1;
        }
        true
    }

    /// Free every live slot.
    pub fn clear(&mut self) {
        while let Some(slot) = self.used_head {
            let handle = self.handle_for(slot);
            self.free(handle);
        }
    }

    /// Whether `handle` still refers to the slot it was issued for.
    ///
    /// Invalid handles and handles from other pools are rejected without
    /// touching memory.
    #[must_use]
    pub fn is_valid(&self, handle: PoolHandle) -> bool {
        self.resolve_live(handle).is_some()
    }

    /// Payload of `handle`'s slot, without checking the generation.
    ///
    /// Check [`Pool::is_valid`] first: a stale handle yields whatever now
    /// occupies the slot.
    #[must_use]
    pub fn payload(&self, handle: PoolHandle) -> &[u8] {
        debug_assert!(self.is_valid(handle), "payload of stale pool handle");
        self.arena.bytes(payload_offset(handle), self.slot_size)
    }

    /// Mutable payload of `handle`'s slot, without checking the generation.
    pub fn payload_mut(&mut self, handle: PoolHandle) -> &mut [u8] {
        debug_assert!(self.is_valid(handle), "payload of stale pool handle");
        self.arena.bytes_mut(payload_offset(handle), self.slot_size)
    }

    /// Address of `handle`'s payload, without checking the generation.
    ///
    /// # Panics
    ///
    /// If `handle` is [`PoolHandle::INVALID`].
    #[must_use]
    pub fn get_ptr(&self, handle: PoolHandle) -> NonNull<u8> {
        self.arena.get_index(payload_offset(handle))
    }

    /// Payload of a live slot.
    #[must_use]
    pub fn get(&self, handle: PoolHandle) -> Option<&[u8]> {
        self.is_valid(handle).then(|| self.payload(handle))
    }

    /// Mutable payload of a live slot.
    pub fn get_mut(&mut self, handle: PoolHandle) -> Option<&mut [u8]> {
        if self.is_valid(handle) {
            Some(self.payload_mut(handle))
        } else {
            None
        }
    }

    /// Read a `T` from the start of a live slot.
    ///
    /// # Panics
    ///
    /// If `T` is larger than the slot.
    #[must_use]
    pub fn read<T: Pod>(&self, handle: PoolHandle) -> Option<T> {
        assert!(size_of::<T>() <= self.slot_size, "type larger than pool slot");
        self.get(handle)
            .map(|bytes| bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()]))
    }

    /// Store `value` at the start of a live slot. Returns `false` if the
    /// handle is stale.
    ///
    /// # Panics
    ///
    /// If `T` is larger than the slot.
    pub fn write<T: Pod>(&mut self, handle: PoolHandle, value: T) -> bool {
        assert!(size_of::<T>() <= self.slot_size, "type larger than pool slot");
        match self.get_mut(handle) {
            Some(bytes) => {
                bytes[..size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
                true
            }
            None => false,
        }
    }

    /// Cursor at the most recently allocated live slot.
    #[must_use]
    pub fn cursor(&self) -> PoolCursor {
        PoolCursor {
            slot: self.used_head,
        }
    }

    /// Handles of all live slots, most recently allocated first.
    #[must_use]
    pub fn handles(&self) -> Handles<'_> {
        Handles {
            slots: &self.slots,
            pool: self.id,
            cursor: self.used_head,
            remaining: self.live,
        }
    }

    /// Snapshot of slot accounting.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.live,
            free: self.free,
            retired: self.retired,
            fresh: self.fresh,
            reused: self.reused,
        }
    }

    /// Slot number of the live slot `handle` refers to.
    fn resolve_live(&self, handle: PoolHandle) -> Option<u32> {
        if handle.pool != self.id {
            return None;
        }
        let end = handle.index.checked_add(SLOT_TAG_SIZE + self.slot_size)?;
        if end > self.arena.pos() {
            return None;
        }
        let slot = u32::from_le_bytes(self.arena.read::<[u8; SLOT_TAG_SIZE]>(handle.index));
        let meta = self.slots.get(slot as usize)?;
        let live = meta.index == handle.index
            && meta.state == SlotState::Live
            && meta.generation == handle.generation;
        live.then_some(slot)
    }

    fn handle_for(&self, slot: u32) -> PoolHandle {
        let meta = &self.slots[slot as usize];
        PoolHandle {
            pool: self.id,
            generation: meta.generation,
            index: meta.index,
        }
    }

    fn link_front(&mut self, slot: u32) {
        let old_head = self.used_head;
        let meta = &mut self.slots[slot as usize];
        meta.prev = None;
        meta.next = old_head;
        match old_head {
            Some(head) => self.slots[head as usize].prev = Some(slot),
            None => self.used_tail = Some(slot),
        }
        self.used_head = Some(slot);
    }

    fn unlink(&mut self, slot: u32) {
        let SlotMeta { prev, next, .. } = self.slots[slot as usize];
        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => self.used_head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].prev = prev,
            None => self.used_tail = prev,
        }
        let meta = &mut self.slots[slot as usize];
        meta.prev = None;
        meta.next = None;
    }

    #[cfg(test)]
    fn force_generation(&mut self, handle: PoolHandle, generation: u32) -> PoolHandle {
        let slot = self.resolve_live(handle).expect("live handle");
        self.slots[slot as usize].generation = generation;
        self.handle_for(slot)
    }
}

/// Arena offset of `handle`'s payload.
fn payload_offset(handle: PoolHandle) -> usize {
    assert!(!handle.is_invalid(), "payload access through PoolHandle::INVALID");
    handle.index + SLOT_TAG_SIZE
}

impl fmt::Debug for Pool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("slot_size", &self.slot_size)
            .field("live", &self.live)
            .field("free", &self.free)
            .field("arena", &self.arena.id())
            .finish_non_exhaustive()
    }
}

/// Position in a pool's live list.
///
/// Only meaningful for the pool that created it, and only until that pool's
/// next allocation or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCursor {
    slot: Option<u32>,
}

impl PoolCursor {
    /// A cursor past the end of every pool.
    pub const END: Self = Self { slot: None };

    /// Whether the cursor is on a slot.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.slot.is_some()
    }

    /// Move to the next older live slot.
    pub fn advance(&mut self, pool: &Pool<'_>) {
        if let Some(slot) = self.slot {
            self.slot = pool.slots[slot as usize].next;
        }
    }

    /// A fresh, currently valid handle to the slot under the cursor, or
    /// [`PoolHandle::INVALID`] past the end.
    #[must_use]
    pub fn handle(&self, pool: &Pool<'_>) -> PoolHandle {
        self.slot
            .map_or(PoolHandle::INVALID, |slot| pool.handle_for(slot))
    }
}

/// Iterator over the handles of a pool's live slots.
#[derive(Debug, Clone)]
pub struct Handles<'p> {
    slots: &'p [SlotMeta],
    pool: u32,
    cursor: Option<u32>,
    remaining: usize,
}

impl Iterator for Handles<'_> {
    type Item = PoolHandle;

    fn next(&mut self) -> Option<PoolHandle> {
        let slot = self.cursor?;
        let meta = &self.slots[slot as usize];
        self.cursor = meta.next;
        self.remaining -= 1;
        Some(PoolHandle {
            pool: self.pool,
            generation: meta.generation,
            index: meta.index,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Handles<'_> {}
