//! One reservation and its committed prefix.
#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;

use crate::error::VmError;
use crate::page::round_up;
use crate::provider::VmProvider;

/// A reserved address range whose first `committed` bytes are usable.
///
/// The committed part is always a prefix of the reservation and always a
/// whole number of pages. The reservation is released on drop.
pub struct Region {
    provider: &'static dyn VmProvider,
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    page_size: usize,
}

// SAFETY: a region exclusively owns its reservation. Shared access only
// hands out `&[u8]` over committed bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve at least `size` bytes (at least one page), committing nothing.
    pub fn reserve(provider: &'static dyn VmProvider, size: usize) -> Result<Self, VmError> {
        let page_size = provider.page_size();
        let reserved =
            round_up(size.max(page_size), page_size).ok_or(VmError::SizeOverflow(size))?;
        let base = provider.reserve(reserved)?;
        tracing::trace!(reserved, page_size, "reserved region");
        Ok(Self {
            provider,
            base,
            reserved,
            committed: 0,
            page_size,
        })
    }

    /// Bytes of address space reserved.
    #[inline]
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Bytes currently committed, a multiple of the page size.
    #[inline]
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Commit granularity of the underlying provider.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The provider this region was reserved from.
    #[must_use]
    pub fn provider(&self) -> &'static dyn VmProvider {
        self.provider
    }

    /// Commit whole pages until at least `bytes` are usable.
    ///
    /// Returns the number of bytes newly committed.
    pub fn grow_to(&mut self, bytes: usize) -> Result<usize, VmError> {
        if bytes <= self.committed {
            return Ok(0);
        }
        if bytes > self.reserved {
            return Err(VmError::OutOfReservation {
                requested: bytes,
                reserved: self.reserved,
            });
        }
        // `reserved` is page aligned, so this cannot pass it.
        let target = round_up(bytes, self.page_size).ok_or(VmError::SizeOverflow(bytes))?;
        let len = target - self.committed;
        // SAFETY: `committed..target` lies inside our live reservation.
        unsafe { self.provider.commit(self.ptr_at(self.committed), len)? };
        self.committed = target;
        tracing::trace!(committed = self.committed, len, "committed pages");
        Ok(len)
    }

    /// Decommit trailing pages that `bytes` does not reach.
    ///
    /// Returns the number of bytes decommitted.
    pub fn shrink_to(&mut self, bytes: usize) -> usize {
        let Some(target) = round_up(bytes, self.page_size) else {
            return 0;
        };
        if target >= self.committed {
            return 0;
        }
        let len = self.committed - target;
        // SAFETY: `target..committed` lies inside our live reservation and
        // `&mut self` rules out outstanding borrows of it.
        unsafe { self.provider.decommit(self.ptr_at(target), len) };
        self.committed = target;
        tracing::trace!(committed = self.committed, len, "decommitted pages");
        len
    }

    /// The committed bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `base..base + committed` is committed, readable memory
        // owned by this region.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.committed) }
    }

    /// The committed bytes, mutably.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, and `&mut self` makes the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.committed) }
    }

    /// Address of the byte at `offset` from the start of the reservation.
    ///
    /// Dereferencing it is only sound while `offset` stays below
    /// [`Region::committed`].
    #[inline]
    #[must_use]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.reserved);
        // SAFETY: offsets within the reservation never wrap to null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().wrapping_add(offset)) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: base and size are exactly what `reserve` produced.
        unsafe { self.provider.release(self.base, self.reserved) };
        tracing::trace!(reserved = self.reserved, "released region");
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("reserved", &self.reserved)
            .field("committed", &self.committed)
            .field("page_size", &self.page_size)
            .finish()
    }
}
