use core::fmt;

use log::debug;

use crate::arch::{encode_redirect, REDIRECT_LEN};
use crate::code::apply_bytes;
use crate::types::{Result, ThreadSuspension};

/// The entry bytes a redirect overwrote. Writing them back restores the
/// function bit for bit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Prologue([u8; REDIRECT_LEN]);

impl Prologue {
    /// # Safety
    /// `address` must point to `REDIRECT_LEN` readable bytes.
    pub unsafe fn capture(address: usize) -> Self {
        Self(core::ptr::read_unaligned(address as *const [u8; REDIRECT_LEN]))
    }

    pub fn from_bytes(bytes: [u8; REDIRECT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; REDIRECT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Prologue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prologue(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Installs and removes entry redirects.
///
/// The override bookkeeping talks to code only through this trait, so it
/// can run against simulated memory in tests.
pub trait CodePatcher {
    /// Overwrite the entry of `target` with a branch to `replacement` and
    /// return the bytes that were there.
    ///
    /// # Safety
    /// `target` must be the entry of a function at least `REDIRECT_LEN`
    /// bytes long, and `replacement` a function with the same signature.
    unsafe fn install(&mut self, target: usize, replacement: usize) -> Result<Prologue>;

    /// Write `saved` back over the entry of `target`.
    ///
    /// # Safety
    /// `saved` must be what [`CodePatcher::install`] returned for `target`.
    unsafe fn restore(&mut self, target: usize, saved: &Prologue) -> Result<()>;
}

/// Patches the live process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePatcher {
    suspension: ThreadSuspension,
}

impl NativePatcher {
    pub fn new(suspension: ThreadSuspension) -> Self {
        Self { suspension }
    }

    pub fn suspension(&self) -> ThreadSuspension {
        self.suspension
    }
}

impl CodePatcher for NativePatcher {
    unsafe fn install(&mut self, target: usize, replacement: usize) -> Result<Prologue> {
        let stub = encode_redirect(target, replacement)?;
        let saved = Prologue::capture(target);
        apply_bytes(target as *mut u8, &stub, self.suspension)?;
        debug!("redirected {:#x} -> {:#x} (saved {:?})", target, replacement, saved);
        Ok(saved)
    }

    unsafe fn restore(&mut self, target: usize, saved: &Prologue) -> Result<()> {
        apply_bytes(target as *mut u8, saved.bytes(), self.suspension)?;
        debug!("restored {:#x}", target);
        Ok(())
    }
}
