//! The process-wide override session.
//!
//! A [`Session`] owns the only [`ChainTable`] in the process. It lives in a
//! global slot because shims reach it from arbitrary call sites; the slot's
//! lock is never held while a replacement body runs.

use std::any::Any;
use std::sync::{Mutex, MutexGuard};

use log::{debug, error, warn};
use stubline_intercept::NativePatcher;

use crate::adapt::IntoReplacement;
use crate::chain::{ChainTable, OverrideId, RemoveMode, Request};
use crate::config::SessionConfig;
use crate::error::{ExpectationsNotMet, Failure, OverrideError, Result, SessionError};
use crate::quota::Quota;
use crate::target::{describe_address, FnPtr, Target};
use crate::tracker::Invocation;

struct SessionState {
    table: ChainTable<NativePatcher>,
    config: SessionConfig,
}

static SLOT: Mutex<Option<SessionState>> = Mutex::new(None);

fn lock() -> MutexGuard<'static, Option<SessionState>> {
    SLOT.lock().unwrap_or_else(|e| e.into_inner())
}

/// A scope in which functions can be overridden.
///
/// Only one session may be open per process. Every override still in place
/// when the session ends is undone; [`Session::finish`] reports what went
/// unmet, dropping the session only logs it.
#[derive(Debug)]
pub struct Session {
    finished: bool,
}

impl Session {
    /// Open a session configured from the environment (see
    /// [`SessionConfig::from_env`]).
    pub fn open() -> std::result::Result<Session, SessionError> {
        Self::with_config(SessionConfig::from_env())
    }

    pub fn with_config(config: SessionConfig) -> std::result::Result<Session, SessionError> {
        let mut slot = lock();
        if slot.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        *slot = Some(SessionState {
            table: ChainTable::new(NativePatcher::new(config.thread_suspension)),
            config,
        });
        debug!("override session opened ({:?})", config);
        Ok(Session { finished: false })
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut ChainTable<NativePatcher>) -> Result<T>) -> Result<T> {
        let mut slot = lock();
        let state = slot.as_mut().ok_or(OverrideError::NoSession)?;
        f(&mut state.table)
    }

    fn register<F, C>(&mut self, target: F, replacement: C, build: impl FnOnce(usize, String) -> Request) -> Result<OverrideId>
    where
        F: FnPtr,
        C: IntoReplacement<F>,
    {
        let target = Target::resolve(target)?;
        let replacement = replacement.into_replacement()?;
        let request = build(replacement.address(), replacement.name().to_string());
        self.with_table(|table| table.request(target, request))
    }

    /// Route the next `quota` calls of `target` to `replacement`.
    ///
    /// If `target` already has overrides, this one waits until they are
    /// used up. The closure's signature must match the target's:
    ///
    /// ```no_run
    /// # use stubline::{Quota, Session};
    /// fn answer() -> u32 { 42 }
    ///
    /// let mut session = Session::open().unwrap();
    /// session.override_fn(answer as fn() -> u32, Quota::ONCE, || 7).unwrap();
    /// ```
    pub fn override_fn<F, C>(&mut self, target: F, quota: Quota, replacement: C) -> Result<OverrideId>
    where
        F: FnPtr,
        C: IntoReplacement<F>,
    {
        self.register(target, replacement, |address, name| Request::new(address, name, quota))
    }

    /// Like [`override_fn`](Self::override_fn), attaching `data` that the
    /// replacement body reads back through [`Invocation::data`].
    pub fn override_with_data<F, C, T>(&mut self, target: F, quota: Quota, replacement: C, data: T) -> Result<OverrideId>
    where
        F: FnPtr,
        C: IntoReplacement<F>,
        T: Any + Send + Sync,
    {
        self.register(target, replacement, |address, name| {
            Request::new(address, name, quota).with_data(data)
        })
    }

    /// Drop the active override of `target`; the next queued one, if any,
    /// takes over.
    pub fn reset<F: FnPtr>(&mut self, target: F) -> Result<()> {
        let target = Target::resolve(target)?;
        self.with_table(|table| table.remove(&target, RemoveMode::First))
    }

    /// Drop every override of `target` and restore it.
    pub fn reset_all<F: FnPtr>(&mut self, target: F) -> Result<()> {
        let target = Target::resolve(target)?;
        self.with_table(|table| table.remove(&target, RemoveMode::All))
    }

    /// Calls absorbed so far by override `id`, or `None` once it has been
    /// used up or removed.
    pub fn calls(&self, id: OverrideId) -> Option<u32> {
        self.with_table(|table| Ok(table.calls(id))).ok().flatten()
    }

    /// Undo every override and report what went unmet.
    ///
    /// # Panics
    /// If an overridden function cannot be restored. The process is left
    /// running patched code at that point and cannot safely continue.
    pub fn finish(mut self) -> std::result::Result<(), ExpectationsNotMet> {
        self.finished = true;
        let Some(mut state) = lock().take() else {
            return Ok(());
        };
        let failures = match state.table.teardown() {
            Ok(failures) => failures,
            Err(e) => panic!("restoring overridden functions failed: {}", e),
        };
        debug!("override session finished with {} failure(s)", failures.len());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExpectationsNotMet { failures })
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(mut state) = lock().take() else {
            return;
        };
        match state.table.teardown() {
            Ok(failures) => {
                for failure in failures {
                    error!("override session dropped unfinished: {}", failure);
                }
            }
            Err(e) => error!("restoring overridden functions failed: {}", e),
        }
    }
}

/// Called by every shim before its body runs.
///
/// Returns the invocation to expose to the body, or `None` when the call
/// cannot be matched to an installed override. Unmatched calls are recorded
/// as failures; the body still runs.
pub(crate) fn on_invocation(replacement: usize) -> Option<Invocation> {
    let mut slot = lock();
    let Some(state) = slot.as_mut() else {
        warn!("replacement {} called with no open session", describe_address(replacement));
        return None;
    };

    match state.table.record_invocation(replacement) {
        Ok(invocation) => Some(invocation),
        Err(OverrideError::OrphanInvocation { .. }) => {
            let name = state
                .table
                .replacement_name(replacement)
                .map(str::to_string)
                .unwrap_or_else(|| describe_address(replacement));
            error!("replacement `{}` called while not installed", name);
            let panic_now = state.config.panic_on_orphan;
            state.table.record_failure(Failure::Orphan {
                replacement: name.clone(),
            });
            drop(slot);
            if panic_now {
                panic!("replacement `{}` called while not installed", name);
            }
            None
        }
        Err(e) => {
            drop(slot);
            panic!("override bookkeeping failed: {}", e)
        }
    }
}

/// Record a failure against the open session, if there is one.
pub(crate) fn report_failure(failure: Failure) {
    let mut slot = lock();
    match slot.as_mut() {
        Some(state) => {
            warn!("{}", failure);
            state.table.record_failure(failure);
        }
        None => error!("{} (no open session to report it to)", failure),
    }
}
