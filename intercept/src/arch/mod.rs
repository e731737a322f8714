//! Redirect encoding for each supported architecture.
//!
//! Both encoders are plain byte functions and always compiled; `native`
//! names the one matching the host.

pub mod arm64;
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as native;

#[cfg(target_arch = "aarch64")]
pub use self::arm64 as native;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub mod native {
    use crate::types::{PatchError, Result};

    pub const REDIRECT_LEN: usize = 1;

    pub fn encode_redirect(_from: usize, _to: usize) -> Result<[u8; REDIRECT_LEN]> {
        Err(PatchError::Unsupported)
    }
}

pub use native::{encode_redirect, REDIRECT_LEN};

/// True when the code at `addr` is an indirect jump stub (PLT entry, import
/// thunk, linker veneer) rather than a function body. Patching such a stub
/// would only catch calls routed through that one stub.
///
/// # Safety
/// `addr` must point to at least 16 readable bytes of code.
pub unsafe fn is_indirect_thunk(addr: usize) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        let code = core::slice::from_raw_parts(addr as *const u8, 16);
        x86_64::is_indirect_thunk(code)
    }
    #[cfg(target_arch = "aarch64")]
    {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = core::ptr::read_unaligned((addr as *const u32).add(i));
        }
        arm64::is_indirect_thunk(&words)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = addr;
        false
    }
}

/// Drop pointer-authentication bits from a code pointer so it can be used
/// as a plain address.
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
#[inline]
pub fn strip_code_ptr(ptr: usize) -> usize {
    let mut x = ptr as u64;
    unsafe {
        core::arch::asm!("xpaci {0}", inout(reg) x, options(nostack, preserves_flags));
    }
    x as usize
}

#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
#[inline]
pub fn strip_code_ptr(ptr: usize) -> usize {
    ptr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn native_redirect_has_native_length() {
        let bytes = encode_redirect(0x10_0000, 0x10_1000).unwrap();
        assert_eq!(bytes.len(), REDIRECT_LEN);
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn ordinary_function_is_not_a_thunk() {
        #[inline(never)]
        fn plain(x: u64) -> u64 {
            std::hint::black_box(x).wrapping_mul(31)
        }
        let addr = strip_code_ptr(plain as fn(u64) -> u64 as usize);
        assert!(!unsafe { is_indirect_thunk(addr) });
    }
}
