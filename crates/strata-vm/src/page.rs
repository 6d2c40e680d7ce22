//! Page size discovery and page rounding.

use std::sync::OnceLock;

/// Page size assumed when the OS cannot be asked.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The platform page size in bytes, queried once and cached.
#[must_use]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(query_page_size)
}

/// Round `size` up to a multiple of `page` (a power of two).
///
/// Returns `None` if the result does not fit in `usize`.
#[inline]
#[must_use]
pub fn round_up(size: usize, page: usize) -> Option<usize> {
    debug_assert!(page.is_power_of_two());
    size.checked_add(page - 1).map(|s| s & !(page - 1))
}

/// Round `size` down to a multiple of `page` (a power of two).
#[inline]
#[must_use]
pub fn round_down(size: usize, page: usize) -> usize {
    debug_assert!(page.is_power_of_two());
    size & !(page - 1)
}

#[cfg(unix)]
#[allow(unsafe_code, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size < 1 {
        tracing::warn!(size, "sysconf returned no page size, using fallback");
        return FALLBACK_PAGE_SIZE;
    }
    size as usize
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn query_page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    // SAFETY: SYSTEM_INFO is plain data and GetSystemInfo fills it in.
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

#[cfg(not(any(unix, windows)))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 1024);
        assert_eq!(page, page_size());
    }

    #[test]
    fn round_up_values() {
        assert_eq!(round_up(0, 4096), Some(0));
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX, 4096), None);
    }

    #[test]
    fn round_down_values() {
        assert_eq!(round_down(0, 4096), 0);
        assert_eq!(round_down(4095, 4096), 0);
        assert_eq!(round_down(8191, 4096), 4096);
        assert_eq!(round_down(8192, 4096), 8192);
    }
}
