use crate::types::{PatchError, Result};

/// A run of pages handed out by [`CodeAllocator`]. Starts read + write;
/// becomes read + execute after [`CodeAllocator::make_executable`].
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

/// Scratch executable memory, used to build code that is later patched
/// (test fixtures, benchmarks) without touching the program's own text.
#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new(crate::code::page_size())
    }
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        let page = crate::code::page_size();
        Self {
            slab_size: slab_size.max(page).next_multiple_of(page),
        }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    fn slice_at(&self, addr: usize) -> CodeSlice {
        CodeSlice {
            data: addr as *mut u8,
            pc: addr as *const u8,
            size: self.slab_size,
        }
    }

    pub fn alloc_any(&mut self) -> Result<CodeSlice> {
        unsafe { self.map() }
    }

    #[cfg(target_os = "linux")]
    unsafe fn map(&self) -> Result<CodeSlice> {
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            self.slab_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(PatchError::AllocationFailed);
        }
        Ok(self.slice_at(ptr as usize))
    }

    #[cfg(target_os = "macos")]
    unsafe fn map(&self) -> Result<CodeSlice> {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_protect};
        use mach2::vm_prot::{VM_PROT_READ, VM_PROT_WRITE};
        use mach2::vm_statistics::VM_FLAGS_ANYWHERE;

        let task = mach_task_self();
        let mut addr: u64 = 0;
        if mach_vm_allocate(task, &mut addr, self.slab_size as u64, VM_FLAGS_ANYWHERE) != KERN_SUCCESS {
            return Err(PatchError::AllocationFailed);
        }
        if mach_vm_protect(task, addr, self.slab_size as u64, 0, VM_PROT_READ | VM_PROT_WRITE) != KERN_SUCCESS {
            let _ = mach_vm_deallocate(task, addr, self.slab_size as u64);
            return Err(PatchError::AllocationFailed);
        }
        Ok(self.slice_at(addr as usize))
    }

    #[cfg(windows)]
    unsafe fn map(&self) -> Result<CodeSlice> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
        let ptr = VirtualAlloc(core::ptr::null(), self.slab_size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
        if ptr.is_null() {
            return Err(PatchError::AllocationFailed);
        }
        Ok(self.slice_at(ptr as usize))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    unsafe fn map(&self) -> Result<CodeSlice> {
        Err(PatchError::Unsupported)
    }

    /// Flip a slice from read + write to read + execute.
    ///
    /// # Safety
    /// `slice` must come from this allocator and not be executing.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<()> {
        crate::code::patcher::make_executable(slice.data, slice.size)?;
        crate::code::cache::invalidate_icache(slice.data, slice.size);
        Ok(())
    }

    /// Unmap a slice.
    ///
    /// # Safety
    /// Nothing may execute or reference the slice afterwards.
    pub unsafe fn release(&self, slice: CodeSlice) -> Result<()> {
        #[cfg(unix)]
        {
            if libc::munmap(slice.data as *mut libc::c_void, slice.size) != 0 {
                return Err(PatchError::AllocationFailed);
            }
            Ok(())
        }
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
            if VirtualFree(slice.data as *mut core::ffi::c_void, 0, MEM_RELEASE) == 0 {
                return Err(PatchError::AllocationFailed);
            }
            Ok(())
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = slice;
            Err(PatchError::Unsupported)
        }
    }
}
