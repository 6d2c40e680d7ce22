//! Platform virtual memory: `mmap` family on unix, `VirtualAlloc` on windows.
#![allow(unsafe_code)]

use std::io;
use std::ptr::NonNull;

use crate::error::VmError;
use crate::provider::VmProvider;

/// Virtual memory straight from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsVm;

#[cfg(unix)]
impl VmProvider for OsVm {
    fn page_size(&self) -> usize {
        crate::page::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert_eq!(size % self.page_size(), 0);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        // SAFETY: anonymous mapping at an address of the kernel's choosing.
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, libc::PROT_NONE, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::Reserve {
                size,
                source: io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VmError::Reserve {
            size,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })
    }

    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        debug_assert_eq!(size % self.page_size(), 0);

        // SAFETY: the caller guarantees the range belongs to a live reservation.
        let rc = unsafe {
            libc::mprotect(
                addr.as_ptr().cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(VmError::Commit {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    unsafe fn decommit(&self, addr: NonNull<u8>, size: usize) {
        debug_assert_eq!(size % self.page_size(), 0);

        // SAFETY: the caller guarantees the range belongs to a live
        // reservation and is no longer referenced.
        unsafe {
            if libc::madvise(addr.as_ptr().cast(), size, libc::MADV_DONTNEED) != 0 {
                tracing::trace!(size, error = %io::Error::last_os_error(), "madvise failed");
            }
            if libc::mprotect(addr.as_ptr().cast(), size, libc::PROT_NONE) != 0 {
                tracing::trace!(size, error = %io::Error::last_os_error(), "mprotect failed");
            }
        }
    }

    unsafe fn release(&self, addr: NonNull<u8>, size: usize) {
        // SAFETY: the caller passes back an untouched reservation.
        if unsafe { libc::munmap(addr.as_ptr().cast(), size) } != 0 {
            tracing::warn!(size, error = %io::Error::last_os_error(), "munmap failed");
        }
    }
}

#[cfg(windows)]
impl VmProvider for OsVm {
    fn page_size(&self) -> usize {
        crate::page::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_READWRITE};

        debug_assert_eq!(size % self.page_size(), 0);

        // SAFETY: a fresh reservation at an address of the system's choosing.
        let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_READWRITE) };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VmError::Reserve {
            size,
            source: io::Error::last_os_error(),
        })
    }

    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};

        // SAFETY: the caller guarantees the range belongs to a live reservation.
        let ptr = unsafe { VirtualAlloc(addr.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(VmError::Commit {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    unsafe fn decommit(&self, addr: NonNull<u8>, size: usize) {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_DECOMMIT};

        // SAFETY: see `commit`.
        if unsafe { VirtualFree(addr.as_ptr().cast(), size, MEM_DECOMMIT) } == 0 {
            tracing::trace!(
                size,
                error = %io::Error::last_os_error(),
                "VirtualFree(MEM_DECOMMIT) failed"
            );
        }
    }

    unsafe fn release(&self, addr: NonNull<u8>, size: usize) {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

        // Size must be zero for MEM_RELEASE.
        // SAFETY: the caller passes back an untouched reservation.
        if unsafe { VirtualFree(addr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
            tracing::warn!(
                size,
                error = %io::Error::last_os_error(),
                "VirtualFree(MEM_RELEASE) failed"
            );
        }
    }
}
