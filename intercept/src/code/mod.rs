pub mod allocator;
pub mod cache;
#[cfg(target_os = "macos")]
mod darwin;
pub mod patcher;

pub use patcher::{apply_bytes, make_executable, make_writable};

/// Size of one virtual-memory page on this host.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }
    #[cfg(not(any(unix, windows)))]
    {
        4096
    }
}

/// Smallest page-aligned span covering `[address, address + len)`.
///
/// Returns `(start, size)`. The span always covers at least one page, and a
/// range that straddles a page boundary covers both pages.
pub fn page_span(address: usize, len: usize, page_size: usize) -> (usize, usize) {
    debug_assert!(page_size.is_power_of_two());
    let mask = page_size - 1;
    let start = address & !mask;
    let end = address.saturating_add(len).saturating_add(mask) & !mask;
    (start, (end - start).max(page_size))
}

#[inline]
pub(crate) fn debug_enabled() -> bool {
    std::env::var_os("STUBLINE_PATCH_DEBUG").is_some()
}
