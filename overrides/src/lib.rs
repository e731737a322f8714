//! stubline - call-count-bounded function overrides for test binaries.
//!
//! A [`Session`] redirects calls of ordinary functions to non-capturing
//! closures for a fixed number of calls, for as long as the session lives,
//! or until removed. Overrides of the same function queue up and take over
//! one after another; when the session ends every function is restored
//! byte for byte and overrides that were called too few times are reported.
//!
//! ```no_run
//! use stubline::{expectation, Quota, Session};
//!
//! #[inline(never)]
//! fn fetch_price(item: u32) -> u64 {
//!     item as u64 * 100
//! }
//!
//! let mut session = Session::open().unwrap();
//! session
//!     .override_fn(fetch_price as fn(u32) -> u64, Quota::times(2).unwrap(), |_item: u32| 0)
//!     .unwrap();
//! session
//!     .override_fn(fetch_price as fn(u32) -> u64, Quota::Unlimited, |item: u32| {
//!         expectation().run_number() as u64 + item as u64
//!     })
//!     .unwrap();
//!
//! assert_eq!(fetch_price(3), 0);
//! assert_eq!(fetch_price(3), 0);
//! assert_eq!(fetch_price(3), 3);
//! session.finish().unwrap();
//! ```

mod adapt;
mod chain;
mod config;
mod error;
mod quota;
mod session;
mod target;
mod tracker;

#[cfg(test)]
mod testing;

pub use adapt::{expectation, try_expectation, IntoReplacement, Replacement};
pub use chain::{ChainTable, OverrideId, RemoveMode, Request};
pub use config::SessionConfig;
pub use error::{ExpectationsNotMet, Failure, OverrideError, Result, SessionError};
pub use quota::Quota;
pub use session::Session;
pub use target::{demangle, FnPtr, Target};
pub use tracker::Invocation;

pub use stubline_intercept::ThreadSuspension;
