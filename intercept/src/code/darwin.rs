//! Patching the main executable's text on hardened macOS.
//!
//! Signed text pages can never regain write permission, so the text segment
//! is replaced wholesale. A shadow copy of `__TEXT`, `__DATA_CONST` and
//! `__DATA` is mapped once; the copy keeps every PC-relative reference
//! (stubs, GOT slots, constants) consistent, so the shadow's copy of
//! [`recreate_text`] can run while the real text is unmapped. Each patch
//! snapshots the live text into scratch memory, applies the bytes there,
//! deallocates the original segment, maps fresh anonymous memory at the same
//! address and copies the patched snapshot back before returning.

use std::sync::OnceLock;

use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::mach_types::{task_t, thread_act_array_t};
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::thread_act::{thread_resume, thread_suspend};
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_allocate, mach_vm_copy, mach_vm_deallocate, mach_vm_protect, mach_vm_region};
use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
use mach2::vm_statistics::{VM_FLAGS_ANYWHERE, VM_FLAGS_FIXED};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

use crate::code::cache::invalidate_icache;
use crate::code::debug_enabled;
use crate::types::{PatchError, Result, ThreadSuspension};

/// Step names reported through `PatchError::SegmentRecreationFailed`.
/// Indexed by `ShadowRequest::failed_step`.
const STEPS: [&str; 10] = [
    "task_threads",
    "allocate scratch",
    "snapshot text",
    "deallocate text",
    "reallocate text",
    "protect text RW",
    "copy text back",
    "protect text RX",
    "release scratch",
    "relocated text address",
];

#[derive(Debug)]
pub(crate) struct Shadow {
    text: usize,
    text_size: usize,
    shadow: usize,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    start: mach_vm_address_t,
    size: mach_vm_size_t,
}

/// Everything the shadow routine needs. Lives on the caller's stack, which
/// stays mapped while text is being replaced.
#[repr(C)]
struct ShadowRequest {
    task: task_t,
    text: mach_vm_address_t,
    text_size: mach_vm_size_t,
    offset: usize,
    bytes: *const u8,
    len: usize,
    suspend: bool,
    failed_step: usize,
}

static TEXT: OnceLock<Option<Region>> = OnceLock::new();
static SHADOW: OnceLock<std::result::Result<Shadow, PatchError>> = OnceLock::new();

unsafe fn region_at(task: task_t, address: mach_vm_address_t) -> std::result::Result<Region, kern_return_t> {
    let mut start = address;
    let mut size: mach_vm_size_t = 0;
    let mut info: vm_region_basic_info_64 = core::mem::zeroed();
    let mut count = vm_region_basic_info_64::count();
    let mut object: mach_port_t = 0;
    let kr = mach_vm_region(
        task,
        &mut start,
        &mut size,
        VM_REGION_BASIC_INFO_64,
        (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
        &mut count,
        &mut object,
    );
    if kr != KERN_SUCCESS {
        return Err(kr);
    }
    Ok(Region { start, size })
}

fn text_region() -> Option<Region> {
    *TEXT.get_or_init(|| unsafe {
        let header = libc::_dyld_get_image_header(0);
        if header.is_null() {
            return None;
        }
        region_at(mach_task_self(), header as mach_vm_address_t).ok()
    })
}

fn fail(step: &'static str, code: kern_return_t) -> PatchError {
    if debug_enabled() {
        eprintln!("[stubline-intercept] shadow segment: {} failed kr={}", step, code);
    }
    PatchError::SegmentRecreationFailed { step, code }
}

unsafe fn build_shadow(text: Region) -> std::result::Result<Shadow, PatchError> {
    let task = mach_task_self();

    let data_const = region_at(task, text.start + text.size).map_err(|kr| fail("locate __DATA_CONST", kr))?;
    if data_const.start != text.start + text.size {
        return Err(fail("locate __DATA_CONST", -1));
    }
    let data = region_at(task, data_const.start + data_const.size).map_err(|kr| fail("locate __DATA", kr))?;
    if data.start != data_const.start + data_const.size {
        return Err(fail("locate __DATA", -1));
    }

    let total = text.size + data_const.size + data.size;
    let mut shadow: mach_vm_address_t = 0;
    let kr = mach_vm_allocate(task, &mut shadow, total, VM_FLAGS_ANYWHERE);
    if kr != KERN_SUCCESS {
        return Err(fail("allocate shadow", kr));
    }

    let copies = [
        (text, shadow),
        (data_const, shadow + text.size),
        (data, shadow + text.size + data_const.size),
    ];
    for (region, dest) in copies {
        let kr = mach_vm_copy(task, region.start, region.size, dest);
        if kr != KERN_SUCCESS {
            let _ = mach_vm_deallocate(task, shadow, total);
            return Err(fail("copy into shadow", kr));
        }
    }

    let kr = mach_vm_protect(task, shadow, total, 0, VM_PROT_READ | VM_PROT_EXECUTE);
    if kr != KERN_SUCCESS {
        let _ = mach_vm_deallocate(task, shadow, total);
        return Err(fail("protect shadow RX", kr));
    }

    if debug_enabled() {
        eprintln!(
            "[stubline-intercept] shadow segment: text={:#x}+{:#x} shadow={:#x}+{:#x}",
            text.start, text.size, shadow, total
        );
    }
    log::debug!("mapped shadow segment at {:#x} for text at {:#x}", shadow, text.start);

    Ok(Shadow {
        text: text.start as usize,
        text_size: text.size as usize,
        shadow: shadow as usize,
    })
}

/// The shadow strategy for `[address, address + len)`, or `None` when the
/// range lies outside the main executable's text and ordinary protection
/// changes apply.
pub(crate) fn shadow_for(address: usize, len: usize) -> Result<Option<&'static Shadow>> {
    let Some(text) = text_region() else {
        return Ok(None);
    };
    let start = text.start as usize;
    let end = start + text.size as usize;
    if address < start || address.saturating_add(len) > end {
        return Ok(None);
    }
    match SHADOW.get_or_init(|| unsafe { build_shadow(text) }) {
        Ok(shadow) => Ok(Some(shadow)),
        Err(e) => Err(e.clone()),
    }
}

impl Shadow {
    /// # Safety
    /// `address` must lie inside the text segment this shadow mirrors.
    pub(crate) unsafe fn patch(&self, address: *mut u8, bytes: &[u8], suspension: ThreadSuspension) -> Result<()> {
        let routine = crate::arch::strip_code_ptr(recreate_text as usize);
        if routine < self.text || routine >= self.text + self.text_size {
            return Err(PatchError::Unsupported);
        }
        let relocated = routine - self.text + self.shadow;
        let shadow_routine: unsafe extern "C" fn(*mut ShadowRequest) -> kern_return_t =
            core::mem::transmute(relocated);

        let mut request = ShadowRequest {
            task: mach_task_self(),
            text: self.text as mach_vm_address_t,
            text_size: self.text_size as mach_vm_size_t,
            offset: address as usize - self.text,
            bytes: bytes.as_ptr(),
            len: bytes.len(),
            suspend: suspension == ThreadSuspension::All,
            failed_step: 0,
        };

        let kr = shadow_routine(&mut request);
        if kr != KERN_SUCCESS {
            let step = STEPS.get(request.failed_step).copied().unwrap_or("unknown");
            return Err(fail(step, kr));
        }

        invalidate_icache(self.text as *mut u8, self.text_size);
        Ok(())
    }
}

/// Runs from the shadow copy while the real text is absent.
///
/// Reads only its argument and constants; stores go to the stack or to
/// freshly mapped memory, since the shadow's `__DATA` is read-only.
#[inline(never)]
unsafe extern "C" fn recreate_text(req: *mut ShadowRequest) -> kern_return_t {
    let req = &mut *req;
    let task = req.task;

    macro_rules! check {
        ($step:expr, $kr:expr) => {{
            let kr = $kr;
            if kr != KERN_SUCCESS {
                req.failed_step = $step;
                return kr;
            }
        }};
    }

    let mut threads: thread_act_array_t = core::ptr::null_mut();
    let mut thread_count: mach_msg_type_number_t = 0;
    let me = mach_thread_self();
    if req.suspend {
        check!(0, task_threads(task, &mut threads, &mut thread_count));
        for i in 0..thread_count as usize {
            let thread = *threads.add(i);
            if thread != me {
                thread_suspend(thread);
            }
        }
    }

    let mut scratch: mach_vm_address_t = 0;
    let mut status = mach_vm_allocate(task, &mut scratch, req.text_size, VM_FLAGS_ANYWHERE);
    let mut step = 1;
    if status == KERN_SUCCESS {
        step = 2;
        status = mach_vm_copy(task, req.text, req.text_size, scratch);
    }
    if status == KERN_SUCCESS {
        let dest = (scratch as *mut u8).add(req.offset);
        for i in 0..req.len {
            core::ptr::write_volatile(dest.add(i), core::ptr::read_volatile(req.bytes.add(i)));
        }
        step = 3;
        status = mach_vm_deallocate(task, req.text, req.text_size);
    }
    if status == KERN_SUCCESS {
        step = 4;
        let mut fresh = req.text;
        status = mach_vm_allocate(task, &mut fresh, req.text_size, VM_FLAGS_FIXED);
        if status == KERN_SUCCESS && fresh != req.text {
            step = 9;
            status = -1;
        }
    }
    if status == KERN_SUCCESS {
        step = 5;
        status = mach_vm_protect(task, req.text, req.text_size, 0, VM_PROT_READ | VM_PROT_WRITE);
    }
    if status == KERN_SUCCESS {
        step = 6;
        status = mach_vm_copy(task, scratch, req.text_size, req.text);
    }
    if status == KERN_SUCCESS {
        step = 7;
        status = mach_vm_protect(task, req.text, req.text_size, 0, VM_PROT_READ | VM_PROT_EXECUTE);
    }
    if scratch != 0 {
        let kr = mach_vm_deallocate(task, scratch, req.text_size);
        if status == KERN_SUCCESS && kr != KERN_SUCCESS {
            step = 8;
            status = kr;
        }
    }

    if req.suspend {
        for i in 0..thread_count as usize {
            let thread = *threads.add(i);
            if thread != me {
                thread_resume(thread);
            }
            mach_port_deallocate(task, thread);
        }
        let _ = mach_vm_deallocate(
            task,
            threads as mach_vm_address_t,
            (thread_count as usize * core::mem::size_of::<mach_port_t>()) as mach_vm_size_t,
        );
    }
    mach_port_deallocate(task, me);

    if status != KERN_SUCCESS {
        req.failed_step = step;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_region_contains_this_function() {
        let text = text_region().expect("main image text");
        let here = crate::arch::strip_code_ptr(text_region_contains_this_function as usize) as u64;
        assert!(here >= text.start && here < text.start + text.size);
    }

    #[test]
    fn heap_addresses_use_protect_path() {
        let local = Box::new(0u8);
        let addr = &*local as *const u8 as usize;
        assert!(shadow_for(addr, 1).expect("lookup").is_none());
    }
}
