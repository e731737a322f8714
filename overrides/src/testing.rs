//! Simulated code memory for exercising override bookkeeping without
//! touching executable pages.

use std::collections::HashMap;

use stubline_intercept::{CodePatcher, PatchError, Prologue, Result, REDIRECT_LEN};

use crate::chain::Request;
use crate::quota::Quota;

#[derive(Debug, Default)]
pub(crate) struct FakePatcher {
    memory: HashMap<usize, [u8; REDIRECT_LEN]>,
    redirects: HashMap<usize, usize>,
    writes: usize,
    fail_next: bool,
}

impl FakePatcher {
    /// Bytes every simulated function starts with before any patching.
    fn original_bytes(address: usize) -> [u8; REDIRECT_LEN] {
        core::array::from_fn(|i| (address as u8).wrapping_add(i as u8))
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes
    }

    pub(crate) fn redirect_at(&self, address: usize) -> Option<usize> {
        self.redirects.get(&address).copied()
    }

    pub(crate) fn is_pristine(&self, address: usize) -> bool {
        self.redirect_at(address).is_none()
            && self
                .memory
                .get(&address)
                .map_or(true, |bytes| *bytes == Self::original_bytes(address))
    }

    pub(crate) fn fail_next_write(&mut self) {
        self.fail_next = true;
    }

    fn check_failure(&mut self, address: usize) -> Result<()> {
        if std::mem::take(&mut self.fail_next) {
            return Err(PatchError::ProtectionChangeFailed {
                address,
                len: REDIRECT_LEN,
                code: 13,
            });
        }
        Ok(())
    }
}

impl CodePatcher for FakePatcher {
    unsafe fn install(&mut self, target: usize, replacement: usize) -> Result<Prologue> {
        self.check_failure(target)?;
        let current = self
            .memory
            .get(&target)
            .copied()
            .unwrap_or_else(|| Self::original_bytes(target));
        self.memory.insert(target, [0xEE; REDIRECT_LEN]);
        self.redirects.insert(target, replacement);
        self.writes += 1;
        Ok(Prologue::from_bytes(current))
    }

    unsafe fn restore(&mut self, target: usize, saved: &Prologue) -> Result<()> {
        self.check_failure(target)?;
        self.memory.insert(target, *saved.bytes());
        self.redirects.remove(&target);
        self.writes += 1;
        Ok(())
    }
}

pub(crate) fn request(replacement: usize, quota: Quota) -> Request {
    Request::new(replacement, format!("r{:#x}", replacement), quota)
}
