use std::fmt;
use std::num::NonZeroU32;

use crate::error::OverrideError;

/// How many calls an override absorbs before the target is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quota {
    /// Exactly this many calls, then the next queued override (or the
    /// original function) takes over.
    Times(NonZeroU32),
    /// Every call until the override is reset or the session ends.
    /// Queued overrides behind it never become active on their own.
    Unlimited,
    /// Like `Unlimited`, but standing apart from any chain: it must be the
    /// only override of its target.
    Always,
}

impl Quota {
    pub const ONCE: Quota = Quota::Times(NonZeroU32::MIN);

    const UNLIMITED_SENTINEL: i64 = -1;
    const ALWAYS_SENTINEL: i64 = -2;

    pub fn times(n: u32) -> Result<Quota, OverrideError> {
        NonZeroU32::new(n).map(Quota::Times).ok_or(OverrideError::InvalidQuota(0))
    }

    /// Decode the integer form: a positive count, `-1` for unlimited or
    /// `-2` for always.
    pub fn from_count(count: i64) -> Result<Quota, OverrideError> {
        match count {
            Self::UNLIMITED_SENTINEL => Ok(Quota::Unlimited),
            Self::ALWAYS_SENTINEL => Ok(Quota::Always),
            n => u32::try_from(n)
                .ok()
                .and_then(NonZeroU32::new)
                .map(Quota::Times)
                .ok_or(OverrideError::InvalidQuota(n)),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Quota::Always)
    }

    /// The fixed call count, if there is one.
    pub fn limit(&self) -> Option<u32> {
        match self {
            Quota::Times(n) => Some(n.get()),
            Quota::Unlimited | Quota::Always => None,
        }
    }
}

impl TryFrom<i64> for Quota {
    type Error = OverrideError;

    fn try_from(count: i64) -> Result<Self, Self::Error> {
        Quota::from_count(count)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Times(n) if n.get() == 1 => write!(f, "once"),
            Quota::Times(n) => write!(f, "{}-call", n),
            Quota::Unlimited => write!(f, "unlimited"),
            Quota::Always => write!(f, "always"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_decode() {
        assert_eq!(Quota::from_count(-1), Ok(Quota::Unlimited));
        assert_eq!(Quota::from_count(-2), Ok(Quota::Always));
        assert_eq!(Quota::from_count(1), Ok(Quota::ONCE));
        assert_eq!(Quota::try_from(3).unwrap().limit(), Some(3));
    }

    #[test]
    fn zero_and_other_negatives_are_invalid() {
        assert_eq!(Quota::from_count(0), Err(OverrideError::InvalidQuota(0)));
        assert_eq!(Quota::from_count(-3), Err(OverrideError::InvalidQuota(-3)));
        assert_eq!(Quota::times(0), Err(OverrideError::InvalidQuota(0)));
        assert!(Quota::from_count(i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Quota::ONCE.to_string(), "once");
        assert_eq!(Quota::times(4).unwrap().to_string(), "4-call");
        assert_eq!(Quota::Always.to_string(), "always");
    }
}
