//! Heap-backed provider for targets without usable virtual memory.
#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use crate::error::VmError;
use crate::provider::VmProvider;

/// Reserves by allocating the whole range up front from the global heap.
///
/// Commit and decommit only move the accounting in [`crate::Region`]; the
/// memory is resident for the whole life of the reservation. Decommitted
/// bytes keep their old contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapVm {
    page_size: usize,
}

impl HeapVm {
    /// Provider using the platform page size.
    #[must_use]
    pub const fn new() -> Self {
        Self { page_size: 0 }
    }

    /// Provider using a fixed page size, handy for small deterministic
    /// regions.
    ///
    /// # Panics
    ///
    /// If `page_size` is not a power of two of at least 64 bytes.
    #[must_use]
    pub const fn with_page_size(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two() && page_size >= 64);
        Self { page_size }
    }

    fn layout(&self, size: usize) -> Option<Layout> {
        Layout::from_size_align(size, self.page_size()).ok()
    }
}

impl VmProvider for HeapVm {
    fn page_size(&self) -> usize {
        if self.page_size == 0 {
            crate::page::page_size()
        } else {
            self.page_size
        }
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        let layout = self
            .layout(size)
            .filter(|l| l.size() > 0)
            .ok_or_else(|| VmError::Reserve {
                size,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| VmError::Reserve {
            size,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })
    }

    unsafe fn commit(&self, _addr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        debug_assert_eq!(size % self.page_size(), 0);
        Ok(())
    }

    unsafe fn decommit(&self, _addr: NonNull<u8>, size: usize) {
        debug_assert_eq!(size % self.page_size(), 0);
    }

    unsafe fn release(&self, addr: NonNull<u8>, size: usize) {
        if let Some(layout) = self.layout(size) {
            // SAFETY: `addr` came from `reserve` with this exact layout.
            unsafe { alloc::dealloc(addr.as_ptr(), layout) };
        }
    }
}
