//! The virtual-memory provider contract.
#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;

use crate::error::VmError;
use crate::heap::HeapVm;
use crate::os::OsVm;

/// Source of page-aligned address ranges.
///
/// The four operations follow the usual virtual-memory lifecycle: `reserve`
/// claims an address range without backing, `commit` makes part of it
/// readable and writable, `decommit` hands the physical pages back while
/// keeping the addresses reserved, and `release` gives up the range.
///
/// Every size passed in must be a multiple of [`VmProvider::page_size`] and
/// every address must be page aligned.
pub trait VmProvider: Send + Sync + fmt::Debug {
    /// Granularity of commit and decommit, in bytes. Always a power of two.
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes of address space.
    ///
    /// Touching the range before committing it is undefined.
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Back `addr..addr + size` with readable, writable memory.
    ///
    /// # Safety
    ///
    /// The range must lie inside a reservation made by this provider that
    /// has not been released.
    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Return the physical pages of `addr..addr + size` to the OS.
    ///
    /// # Safety
    ///
    /// Same as [`VmProvider::commit`]. No live reference may point into the
    /// range.
    unsafe fn decommit(&self, addr: NonNull<u8>, size: usize);

    /// Release a whole reservation.
    ///
    /// # Safety
    ///
    /// `addr` and `size` must be exactly what [`VmProvider::reserve`]
    /// returned and was asked for. The range must not be used afterwards.
    unsafe fn release(&self, addr: NonNull<u8>, size: usize);
}

static OS_VM: OsVm = OsVm;
static HEAP_VM: HeapVm = HeapVm::new();

/// The platform virtual-memory provider.
#[must_use]
pub fn os_provider() -> &'static dyn VmProvider {
    &OS_VM
}

/// A provider backed by the global heap, for targets without usable
/// virtual memory.
#[must_use]
pub fn heap_provider() -> &'static dyn VmProvider {
    &HEAP_VM
}
