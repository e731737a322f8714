//! Matching replacement executions back to the override that routed them.

use std::any::Any;
use std::fmt;

use stubline_intercept::CodePatcher;

use crate::chain::{ChainTable, OverrideId, Payload};
use crate::error::{Failure, OverrideError, Result};
use crate::quota::Quota;

/// One call that landed in a replacement, as seen from inside its body.
#[derive(Clone)]
pub struct Invocation {
    id: OverrideId,
    target: String,
    run: u32,
    quota: Quota,
    data: Option<Payload>,
}

impl Invocation {
    pub fn id(&self) -> OverrideId {
        self.id
    }

    /// Zero-based index of this call among the calls the override absorbed.
    pub fn run_number(&self) -> u32 {
        self.run
    }

    /// Name of the overridden function.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// The value passed to `Session::override_with_data`, if it has type `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }

    /// Compare the arguments this call received with the expected ones.
    ///
    /// A mismatch is recorded against the session and reported when it
    /// finishes; the call itself carries on.
    pub fn check_args<T>(&self, expected: &T, actual: &T) -> bool
    where
        T: PartialEq + fmt::Debug + ?Sized,
    {
        if expected == actual {
            return true;
        }
        crate::session::report_failure(Failure::ArgumentMismatch {
            target: self.target.clone(),
            run: self.run,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        });
        false
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("run", &self.run)
            .field("quota", &self.quota)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

impl<P: CodePatcher> ChainTable<P> {
    /// Account for one execution of `replacement`.
    ///
    /// Finds the installed override that points at it and counts the call.
    /// The call that uses up a fixed quota also restores the target and
    /// installs the next queued override before this returns.
    pub fn record_invocation(&mut self, replacement: usize) -> Result<Invocation> {
        let found = self.slots.iter_mut().find_map(|slot| {
            let (target, active) = slot.split_active();
            let record = active.filter(|r| r.saved.is_some() && r.replacement == replacement)?;
            record.calls = record.calls.saturating_add(1);
            let invocation = Invocation {
                id: record.id,
                target: target.name().to_string(),
                run: record.calls - 1,
                quota: record.quota,
                data: record.data.clone(),
            };
            let exhausted = record.quota.limit() == Some(record.calls);
            Some((target.address(), invocation, exhausted))
        });

        let Some((address, invocation, exhausted)) = found else {
            return Err(OverrideError::OrphanInvocation { replacement });
        };
        if exhausted {
            self.advance(address)?;
        }
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::target::Target;
    use crate::testing::{request, FakePatcher};

    const T: usize = 0x1000;
    const U: usize = 0x2000;

    fn table() -> ChainTable<FakePatcher> {
        ChainTable::new(FakePatcher::default())
    }

    #[test]
    fn counted_override_hands_over_on_last_call() {
        let mut table = table();
        let t = Target::synthetic(T, "t");
        table.request(t.clone(), request(0xA1, Quota::times(2).unwrap())).unwrap();
        table.request(t, request(0xA2, Quota::Unlimited)).unwrap();

        let first = table.record_invocation(0xA1).unwrap();
        assert_eq!(first.run_number(), 0);
        assert_eq!(table.installed_replacement(T), Some(0xA1));

        let second = table.record_invocation(0xA1).unwrap();
        assert_eq!(second.run_number(), 1);
        assert_eq!(table.installed_replacement(T), Some(0xA2));

        for run in 0..5 {
            assert_eq!(table.record_invocation(0xA2).unwrap().run_number(), run);
        }
        assert_eq!(table.installed_replacement(T), Some(0xA2));
    }

    #[test]
    fn call_past_quota_is_an_orphan() {
        let mut table = table();
        table.request(Target::synthetic(T, "t"), request(0xA1, Quota::ONCE)).unwrap();
        table.record_invocation(0xA1).unwrap();
        assert!(table.patcher().is_pristine(T));
        assert_eq!(
            table.record_invocation(0xA1).unwrap_err(),
            OverrideError::OrphanInvocation { replacement: 0xA1 }
        );
    }

    #[test]
    fn queued_replacement_is_not_yet_callable() {
        let mut table = table();
        let t = Target::synthetic(T, "t");
        table.request(t.clone(), request(0xA1, Quota::ONCE)).unwrap();
        table.request(t, request(0xA2, Quota::ONCE)).unwrap();
        assert!(table.record_invocation(0xA2).is_err());
    }

    #[test]
    fn always_survives_other_chains() {
        let mut table = table();
        table.request(Target::synthetic(U, "u"), request(0xB1, Quota::Always)).unwrap();
        table.request(Target::synthetic(T, "t"), request(0xA1, Quota::ONCE)).unwrap();

        table.record_invocation(0xA1).unwrap();
        let inv = table.record_invocation(0xB1).unwrap();
        assert_eq!(inv.quota(), Quota::Always);
        assert_eq!(inv.target(), "u");
        assert_eq!(table.installed_replacement(U), Some(0xB1));
        assert!(table.patcher().is_pristine(T));
    }

    #[test]
    fn data_is_typed() {
        let mut table = table();
        let mut req = request(0xA1, Quota::Unlimited);
        req.data = Some(Arc::new(String::from("ctx")));
        table.request(Target::synthetic(T, "t"), req).unwrap();

        let inv = table.record_invocation(0xA1).unwrap();
        assert_eq!(inv.data::<String>().map(String::as_str), Some("ctx"));
        assert!(inv.data::<u32>().is_none());
    }

    #[test]
    fn matching_args_pass() {
        let mut table = table();
        table.request(Target::synthetic(T, "t"), request(0xA1, Quota::ONCE)).unwrap();
        let inv = table.record_invocation(0xA1).unwrap();
        assert!(inv.check_args(&(1, "a"), &(1, "a")));
        assert!(inv.check_args("abc", "abc"));
    }
}
