#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
    fn sys_dcache_flush(addr: *mut core::ffi::c_void, size: usize);
}

/// Make freshly written instructions visible to instruction fetch.
///
/// AArch64 keeps separate, non-coherent data and instruction caches, so the
/// written lines are cleaned to the point of unification and the stale
/// instruction lines dropped. x86-64 snoops stores into the instruction
/// stream and needs nothing on Unix. Windows always gets
/// `FlushInstructionCache`, which is documented as required on every
/// architecture.
///
/// # Safety
/// `addr` must point to at least `size` bytes of mapped memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(target_os = "macos")]
    {
        sys_dcache_flush(addr as *mut core::ffi::c_void, size);
        sys_icache_invalidate(addr as *mut core::ffi::c_void, size);
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;
        FlushInstructionCache(GetCurrentProcess(), addr as *const core::ffi::c_void, size);
    }

    #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "aarch64"), windows)))]
    {
        let _ = (addr, size);
    }
}
