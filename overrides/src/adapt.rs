//! Turning non-capturing closures into functions that can stand in for a
//! target.
//!
//! Each closure type gets its own monomorphised shim with exactly the
//! target's signature. The shim's entry is what the target is redirected
//! to; when it runs it reports the call to the session, then runs the
//! closure body with the matching [`Invocation`] available through
//! [`expectation`].

use std::cell::RefCell;
use std::fmt;

use stubline_intercept::arch::strip_code_ptr;

use crate::error::{OverrideError, Result};
use crate::target::FnPtr;
use crate::tracker::Invocation;

/// A shim ready to be installed over a target of type `F`.
pub struct Replacement<F: FnPtr> {
    function: F,
    address: usize,
    name: String,
}

impl<F: FnPtr> Replacement<F> {
    /// Code address of the shim.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Type name of the closure behind the shim.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shim as a callable function pointer. Calling it while no
    /// installed override points at it is reported as an orphan invocation.
    pub fn as_fn(&self) -> F {
        self.function
    }
}

impl<F: FnPtr> Clone for Replacement<F> {
    fn clone(&self) -> Self {
        Replacement {
            function: self.function,
            address: self.address,
            name: self.name.clone(),
        }
    }
}

impl<F: FnPtr> fmt::Debug for Replacement<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replacement")
            .field("address", &format_args!("{:#x}", self.address))
            .field("name", &self.name)
            .finish()
    }
}

/// Closures that can replace a function of type `F`.
///
/// Implemented for every `Fn + Copy + 'static` closure whose signature
/// matches `F`, for `fn` and `extern "C" fn` targets of up to six
/// arguments. Closure parameters need explicit types: `|x: u32| x + 1`.
/// Closures that capture anything are rejected with
/// [`OverrideError::CapturingReplacement`].
pub trait IntoReplacement<F: FnPtr> {
    fn into_replacement(self) -> Result<Replacement<F>>;
}

impl<F: FnPtr> IntoReplacement<F> for Replacement<F> {
    fn into_replacement(self) -> Result<Replacement<F>> {
        Ok(self)
    }
}

thread_local! {
    /// One frame per running replacement body; `None` for calls no override
    /// accounted for.
    static ACTIVE: RefCell<Vec<Option<Invocation>>> = const { RefCell::new(Vec::new()) };
}

struct ActiveGuard;

impl ActiveGuard {
    fn push(invocation: Option<Invocation>) -> Self {
        ACTIVE.with(|stack| stack.borrow_mut().push(invocation));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The call being served by the innermost replacement body on this thread.
///
/// # Panics
/// Outside a replacement body.
pub fn expectation() -> Invocation {
    try_expectation().unwrap_or_else(|| panic!("stubline::expectation() called outside a replacement body"))
}

/// Like [`expectation`], but `None` outside a replacement body and inside
/// the body of a call that no override accounted for.
pub fn try_expectation() -> Option<Invocation> {
    ACTIVE.with(|stack| stack.borrow().last().cloned().flatten())
}

fn dispatch<R>(replacement: usize, body: impl FnOnce() -> R) -> R {
    let _active = ActiveGuard::push(crate::session::on_invocation(replacement));
    body()
}

/// # Safety
/// `C` must be zero-sized and have no drop glue.
unsafe fn conjure<C>() -> C {
    debug_assert_eq!(core::mem::size_of::<C>(), 0);
    core::mem::zeroed()
}

macro_rules! impl_into_replacement {
    ($abi:literal; $($arg:ident: $ty:ident),*) => {
        impl<C, R, $($ty),*> IntoReplacement<extern $abi fn($($ty),*) -> R> for C
        where
            C: Fn($($ty),*) -> R + Copy + 'static,
            R: 'static,
            $($ty: 'static,)*
        {
            fn into_replacement(self) -> Result<Replacement<extern $abi fn($($ty),*) -> R>> {
                #[allow(improper_ctypes_definitions)]
                extern $abi fn shim<C, R, $($ty),*>($($arg: $ty),*) -> R
                where
                    C: Fn($($ty),*) -> R + Copy + 'static,
                    R: 'static,
                    $($ty: 'static,)*
                {
                    let this: extern $abi fn($($ty),*) -> R = shim::<C, R, $($ty),*>;
                    dispatch(strip_code_ptr(this as usize), move || {
                        // SAFETY: shims are only handed out for zero-sized closures,
                        // and `Copy` rules out drop glue.
                        let body: C = unsafe { conjure::<C>() };
                        body($($arg),*)
                    })
                }

                let name = std::any::type_name::<C>().to_string();
                if core::mem::size_of::<C>() != 0 {
                    return Err(OverrideError::CapturingReplacement(name));
                }
                let function: extern $abi fn($($ty),*) -> R = shim::<C, R, $($ty),*>;
                Ok(Replacement {
                    function,
                    address: strip_code_ptr(function as usize),
                    name,
                })
            }
        }
    };
}

macro_rules! impl_for_both_abis {
    ($($arg:ident: $ty:ident),*) => {
        impl_into_replacement!("Rust"; $($arg: $ty),*);
        impl_into_replacement!("C"; $($arg: $ty),*);
    };
}

impl_for_both_abis!();
impl_for_both_abis!(a1: A1);
impl_for_both_abis!(a1: A1, a2: A2);
impl_for_both_abis!(a1: A1, a2: A2, a3: A3);
impl_for_both_abis!(a1: A1, a2: A2, a3: A3, a4: A4);
impl_for_both_abis!(a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);
impl_for_both_abis!(a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_closures_get_distinct_shims() {
        let a = IntoReplacement::<fn(u32) -> u32>::into_replacement(|x: u32| x + 1).unwrap();
        let b = IntoReplacement::<fn(u32) -> u32>::into_replacement(|x: u32| x + 2).unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(a.as_fn() as usize, a.address());
        assert!(a.name().contains("closure"), "got {}", a.name());
    }

    #[test]
    fn capturing_closure_is_rejected() {
        let offset = 7u32;
        let err = IntoReplacement::<fn(u32) -> u32>::into_replacement(move |x: u32| x + offset).unwrap_err();
        assert!(matches!(err, OverrideError::CapturingReplacement(_)));
    }

    #[test]
    fn extern_c_and_zero_arity_shims() {
        let c = IntoReplacement::<extern "C" fn(i32, i32) -> i32>::into_replacement(|a: i32, b: i32| a * b).unwrap();
        let unit = IntoReplacement::<fn() -> ()>::into_replacement(|| ()).unwrap();
        assert_ne!(c.address(), 0);
        assert_ne!(unit.address(), 0);
    }

    #[test]
    fn unaccounted_frame_hides_outer_invocation() {
        let outer = {
            let mut table = crate::chain::ChainTable::new(crate::testing::FakePatcher::default());
            let target = crate::target::Target::synthetic(0x1000, "outer");
            table
                .request(target, crate::testing::request(0xA1, crate::quota::Quota::Unlimited))
                .unwrap();
            table.record_invocation(0xA1).unwrap()
        };

        let _outer = ActiveGuard::push(Some(outer));
        assert_eq!(try_expectation().map(|inv| inv.target().to_string()).as_deref(), Some("outer"));
        {
            let _orphan = ActiveGuard::push(None);
            assert!(try_expectation().is_none());
        }
        assert!(try_expectation().is_some());
    }

    #[test]
    fn expectation_is_scoped_to_body() {
        assert!(try_expectation().is_none());
        let result = std::panic::catch_unwind(expectation);
        assert!(result.is_err());
    }
}
