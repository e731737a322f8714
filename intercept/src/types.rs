use thiserror::Error;

/// Errors raised while encoding or applying a redirect.
///
/// Everything except the two encoding errors is a platform failure: the
/// affected code region may be left in an unknown protection state and the
/// caller must not keep patching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("branch from {from:#x} to {to:#x} does not fit the relative displacement field")]
    DisplacementOutOfRange { from: usize, to: usize },

    #[error("branch target {to:#x} is not instruction-aligned relative to {from:#x}")]
    MisalignedTarget { from: usize, to: usize },

    #[error("cannot change protection of {len} byte(s) at {address:#x} (os error {code})")]
    ProtectionChangeFailed { address: usize, len: usize, code: i32 },

    #[error("recreating the text segment failed during {step} (kern_return {code})")]
    SegmentRecreationFailed { step: &'static str, code: i32 },

    #[error("executable memory allocation failed")]
    AllocationFailed,

    #[error("code patching is not supported on this platform")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// How other threads are treated while a code segment is being recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSuspension {
    /// Suspend every thread except the patching one.
    #[default]
    All,
    /// Leave other threads running. Only safe when the process is single-threaded.
    None,
}

/// Symbol covering a code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Raw (possibly mangled) symbol name.
    pub name: String,
    /// File name of the image containing the symbol.
    pub module: String,
    /// Distance from the symbol start to the queried address.
    pub offset: usize,
}
