//! Turning a function value into the code address that gets patched.

use std::fmt;

use stubline_intercept::arch::{is_indirect_thunk, strip_code_ptr};
use stubline_intercept::module::resolve_symbol;

use crate::error::{OverrideError, Result};

/// A plain function pointer type whose value is a code address.
///
/// Implemented for `fn` and `extern "C" fn` pointers of up to six
/// arguments. Function items coerce with a cast: `bar as fn(u32) -> u32`.
pub trait FnPtr: Copy + 'static {
    fn address(self) -> usize;
}

macro_rules! impl_fn_ptr {
    ($($arg:ident),*) => {
        impl<R: 'static, $($arg: 'static),*> FnPtr for fn($($arg),*) -> R {
            fn address(self) -> usize {
                self as usize
            }
        }

        impl<R: 'static, $($arg: 'static),*> FnPtr for extern "C" fn($($arg),*) -> R {
            fn address(self) -> usize {
                self as usize
            }
        }
    };
}

impl_fn_ptr!();
impl_fn_ptr!(A1);
impl_fn_ptr!(A1, A2);
impl_fn_ptr!(A1, A2, A3);
impl_fn_ptr!(A1, A2, A3, A4);
impl_fn_ptr!(A1, A2, A3, A4, A5);
impl_fn_ptr!(A1, A2, A3, A4, A5, A6);

/// A function entry that can be overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    address: usize,
    name: String,
}

impl Target {
    pub fn resolve<F: FnPtr>(function: F) -> Result<Target> {
        // SAFETY: a function pointer is always a function entry or a stub
        // in front of one, and both are readable code.
        unsafe { Self::from_address(function.address()) }
    }

    /// Build a target from a raw code address.
    ///
    /// Fails closed on dispatch stubs (PLT entries, import thunks, veneers,
    /// `{{vtable.shim}}`/`{{reify.shim}}` adapters): patching one would miss
    /// every call that reaches the function another way.
    ///
    /// # Safety
    /// `address` must point at readable code.
    pub unsafe fn from_address(address: usize) -> Result<Target> {
        let address = strip_code_ptr(address);
        if address == 0 {
            return Err(OverrideError::NotAFunction(0));
        }

        let symbol = resolve_symbol(address);
        let name = symbol
            .as_ref()
            .map(|s| display_symbol(&s.name))
            .unwrap_or_else(|| format!("{:#x}", address));

        if is_shim_name(&name) || is_indirect_thunk(address) {
            return Err(OverrideError::DispatchThunk(name));
        }
        if symbol.is_some_and(|s| s.offset != 0) {
            return Err(OverrideError::NotAFunction(address));
        }

        Ok(Target { address, name })
    }

    #[cfg(test)]
    pub(crate) fn synthetic(address: usize, name: &str) -> Target {
        Target {
            address,
            name: name.to_string(),
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Human-readable name for any code address.
pub(crate) fn describe_address(address: usize) -> String {
    match resolve_symbol(address) {
        Some(s) if s.offset == 0 => display_symbol(&s.name),
        Some(s) => format!("{}+{:#x}", display_symbol(&s.name), s.offset),
        None => format!("{:#x}", address),
    }
}

fn is_shim_name(name: &str) -> bool {
    name.contains("{{vtable.shim}}") || name.contains("{{reify.shim}}")
}

fn display_symbol(raw: &str) -> String {
    demangle(raw).unwrap_or_else(|| raw.to_string())
}

/// Demangle a legacy Rust symbol (`_ZN...E`), dropping the trailing hash.
/// Returns `None` for anything else, including v0 (`_R...`) symbols, which
/// are then shown raw.
pub fn demangle(symbol: &str) -> Option<String> {
    let mut rest = symbol.strip_prefix("_ZN").or_else(|| symbol.strip_prefix("__ZN"))?;
    let mut segments = Vec::new();
    while !rest.starts_with('E') {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let len: usize = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        segments.push(rest.get(..len)?);
        rest = &rest[len..];
    }

    if segments.len() > 1 && segments.last().is_some_and(|s| is_hash(s)) {
        segments.pop();
    }
    let decoded = segments.into_iter().map(decode_ident).collect::<Option<Vec<_>>>()?;
    Some(decoded.join("::"))
}

fn is_hash(segment: &str) -> bool {
    segment.len() == 17
        && segment.starts_with('h')
        && segment[1..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn decode_ident(ident: &str) -> Option<String> {
    let mut rest = ident;
    if rest.starts_with("_$") {
        rest = &rest[1..];
    }
    let mut out = String::with_capacity(rest.len());
    while let Some(ch) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("..") {
            out.push_str("::");
            rest = after;
        } else if ch == '$' {
            let end = rest[1..].find('$')? + 1;
            out.push(match &rest[1..end] {
                "SP" => '@',
                "BP" => '*',
                "RF" => '&',
                "LT" => '<',
                "GT" => '>',
                "LP" => '(',
                "RP" => ')',
                "C" => ',',
                esc => {
                    let hex = esc.strip_prefix('u')?;
                    char::from_u32(u32::from_str_radix(hex, 16).ok()?)?
                }
            });
            rest = &rest[end + 1..];
        } else {
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_plain_path() {
        assert_eq!(
            demangle("_ZN4core3ptr13drop_in_place17h0123456789abcdefE").as_deref(),
            Some("core::ptr::drop_in_place")
        );
    }

    #[test]
    fn demangles_escapes() {
        assert_eq!(
            demangle("_ZN8stubline5tests4once28_$u7b$$u7b$closure$u7d$$u7d$17h0123456789abcdefE").as_deref(),
            Some("stubline::tests::once::{{closure}}")
        );
        assert_eq!(
            demangle("_ZN38_$LT$T$u20$as$u20$core..fmt..Debug$GT$3fmt17h0123456789abcdefE").as_deref(),
            Some("<T as core::fmt::Debug>::fmt")
        );
    }

    #[test]
    fn macho_prefix_and_missing_hash() {
        assert_eq!(demangle("__ZN3foo3barE").as_deref(), Some("foo::bar"));
    }

    #[test]
    fn non_rust_symbols_are_left_alone() {
        assert_eq!(demangle("malloc"), None);
        assert_eq!(demangle("_ZN3fooX"), None);
        assert_eq!(demangle("_ZN9shortE"), None);
    }

    #[test]
    fn vtable_shims_are_recognised() {
        let name = demangle(
            "_ZN4core3ops8function6FnOnce40call_once$u7b$$u7b$vtable.shim$u7d$$u7d$17h0123456789abcdefE",
        )
        .unwrap();
        assert_eq!(name, "core::ops::function::FnOnce::call_once{{vtable.shim}}");
        assert!(is_shim_name(&name));
    }

    #[inline(never)]
    fn resolvable_target(x: u64) -> u64 {
        std::hint::black_box(x).rotate_left(7)
    }

    #[test]
    #[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn resolves_local_function() {
        let target = Target::resolve(resolvable_target as fn(u64) -> u64).unwrap();
        assert!(target.name().ends_with("resolvable_target"), "got {}", target.name());
        assert_eq!(target.address(), resolvable_target as fn(u64) -> u64 as usize);
    }

    #[test]
    fn null_is_not_a_function() {
        assert_eq!(unsafe { Target::from_address(0) }, Err(OverrideError::NotAFunction(0)));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn plt_shaped_code_is_rejected() {
        // endbr64 ; bnd jmp [rip+0x2fe2]
        let stub: [u8; 16] = [0xF3, 0x0F, 0x1E, 0xFA, 0xF2, 0xFF, 0x25, 0xE2, 0x2F, 0, 0, 0x90, 0x90, 0x90, 0x90, 0x90];
        let err = unsafe { Target::from_address(stub.as_ptr() as usize) }.unwrap_err();
        assert!(matches!(err, OverrideError::DispatchThunk(_)));
    }
}
