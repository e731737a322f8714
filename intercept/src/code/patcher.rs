use crate::code::cache::invalidate_icache;
use crate::code::{debug_enabled, page_size, page_span};
use crate::types::{PatchError, Result, ThreadSuspension};

fn last_os_error() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(unix)]
unsafe fn protect(address: usize, len: usize, prot: libc::c_int) -> Result<()> {
    let (start, size) = page_span(address, len, page_size());
    if libc::mprotect(start as *mut libc::c_void, size, prot) != 0 {
        let code = last_os_error();
        if debug_enabled() {
            eprintln!(
                "[stubline-intercept] mprotect({:#x}, {:#x}, {:#x}) failed errno={}",
                start, size, prot, code
            );
        }
        return Err(PatchError::ProtectionChangeFailed { address, len, code });
    }
    Ok(())
}

#[cfg(windows)]
unsafe fn protect(address: usize, len: usize, prot: u32) -> Result<u32> {
    use windows_sys::Win32::System::Memory::VirtualProtect;
    let (start, size) = page_span(address, len, page_size());
    let mut old = 0u32;
    if VirtualProtect(start as *const core::ffi::c_void, size, prot, &mut old) == 0 {
        let code = last_os_error();
        if debug_enabled() {
            eprintln!(
                "[stubline-intercept] VirtualProtect({:#x}, {:#x}, {:#x}) failed error={}",
                start, size, prot, code
            );
        }
        return Err(PatchError::ProtectionChangeFailed { address, len, code });
    }
    Ok(old)
}

/// Make every page spanned by `[address, address + len)` writable.
///
/// Execute permission is kept so other code sharing the pages keeps running,
/// except on macOS where the kernel refuses writable + executable mappings
/// and the pages are read + write until [`make_executable`].
///
/// # Safety
/// The range must be mapped. Nothing may rely on the pages being read-only
/// until [`make_executable`] is called.
pub unsafe fn make_writable(address: *mut u8, len: usize) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        protect(address as usize, len, libc::PROT_READ | libc::PROT_WRITE)
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        protect(address as usize, len, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::PAGE_EXECUTE_READWRITE;
        protect(address as usize, len, PAGE_EXECUTE_READWRITE).map(|_| ())
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (address, len);
        Err(PatchError::Unsupported)
    }
}

/// Drop the pages spanned by `[address, address + len)` back to read + execute.
///
/// # Safety
/// The range must be mapped.
pub unsafe fn make_executable(address: *mut u8, len: usize) -> Result<()> {
    #[cfg(unix)]
    {
        protect(address as usize, len, libc::PROT_READ | libc::PROT_EXEC)
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::PAGE_EXECUTE_READ;
        protect(address as usize, len, PAGE_EXECUTE_READ).map(|_| ())
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (address, len);
        Err(PatchError::Unsupported)
    }
}

#[cfg(unix)]
unsafe fn apply_with_protect(address: *mut u8, bytes: &[u8]) -> Result<()> {
    make_writable(address, bytes.len())?;
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), address, bytes.len());
    make_executable(address, bytes.len())?;

    // Flush the whole span AFTER restoring RX so neighbouring functions on
    // the same page never run from stale lines.
    let (start, size) = page_span(address as usize, bytes.len(), page_size());
    invalidate_icache(start as *mut u8, size);
    Ok(())
}

#[cfg(windows)]
unsafe fn apply_with_protect(address: *mut u8, bytes: &[u8]) -> Result<()> {
    use windows_sys::Win32::System::Memory::PAGE_EXECUTE_READWRITE;
    let old = protect(address as usize, bytes.len(), PAGE_EXECUTE_READWRITE)?;
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), address, bytes.len());
    protect(address as usize, bytes.len(), old)?;
    invalidate_icache(address, bytes.len());
    Ok(())
}

/// Overwrite `bytes.len()` bytes of executable code at `address`.
///
/// On Linux and other Unixes the spanned pages are switched to RWX, written
/// and switched back to RX before the instruction cache is invalidated.
/// Windows does the same through `VirtualProtect`, restoring whatever
/// protection the pages had. On macOS code inside the main executable's text
/// segment cannot be made writable, so that segment is recreated around the
/// patch from a shadow copy; `suspension` controls whether other threads are
/// frozen meanwhile. Everything else on macOS goes through the protect path.
///
/// Errors are platform failures and leave the range in an unknown state.
///
/// # Safety
/// `address` must point to `bytes.len()` bytes of executable code that no
/// other thread executes while it is rewritten.
pub unsafe fn apply_bytes(address: *mut u8, bytes: &[u8], suspension: ThreadSuspension) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(shadow) = crate::code::darwin::shadow_for(address as usize, bytes.len())? {
            return shadow.patch(address, bytes, suspension);
        }
    }
    #[cfg(not(target_os = "macos"))]
    let _ = suspension;

    #[cfg(any(unix, windows))]
    {
        apply_with_protect(address, bytes)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = address;
        Err(PatchError::Unsupported)
    }
}
