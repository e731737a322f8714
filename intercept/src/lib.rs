//! stubline-intercept: redirect stubs and executable-memory patching.
//!
//! The pieces, leaf first:
//! - [`arch`] encodes the branch written over a function entry.
//! - [`code`] changes page protection, writes the bytes and keeps the
//!   instruction cache coherent (with a shadow-segment path for hardened
//!   macOS text).
//! - [`module`] names the function behind an address.
//! - [`redirect`] ties them together behind [`CodePatcher`].

pub mod arch;
pub mod code;
pub mod module;
pub mod redirect;
pub mod types;

pub use arch::{encode_redirect, REDIRECT_LEN};
pub use redirect::{CodePatcher, NativePatcher, Prologue};
pub use types::{PatchError, Result, SymbolInfo, ThreadSuspension};

/// Process-global lock for tests that modify executable code.
///
/// Tests that patch code reachable from other tests must hold it, or a
/// concurrent test may execute a half-written entry.
#[doc(hidden)]
pub fn lock_patch_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
