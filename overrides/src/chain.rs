//! Which override owns each target, and in what order the rest wait.
//!
//! Every target has a slot holding at most one `Always` override and a FIFO
//! chain of counted or unlimited ones. At most one record per slot is
//! installed: the `Always` override, or else the head of the chain.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::debug;
use stubline_intercept::{CodePatcher, PatchError, Prologue};

use crate::error::{Failure, OverrideError, Result};
use crate::quota::Quota;
use crate::target::Target;

pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// Identifies one requested override within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverrideId(u64);

impl fmt::Display for OverrideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How much [`ChainTable::remove`] takes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// The active override only; the next queued one takes over.
    First,
    /// Every override of the target.
    All,
}

/// What the caller asked to have installed.
pub struct Request {
    pub(crate) replacement: usize,
    pub(crate) replacement_name: String,
    pub(crate) quota: Quota,
    pub(crate) data: Option<Payload>,
}

impl Request {
    pub fn new(replacement: usize, replacement_name: impl Into<String>, quota: Quota) -> Self {
        Request {
            replacement,
            replacement_name: replacement_name.into(),
            quota,
            data: None,
        }
    }

    /// Attach a value the replacement reads back through `Invocation::data`.
    pub fn with_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }
}

pub(crate) struct OverrideRecord {
    pub(crate) id: OverrideId,
    pub(crate) replacement: usize,
    pub(crate) replacement_name: String,
    pub(crate) quota: Quota,
    pub(crate) calls: u32,
    /// Present exactly while the redirect is written into the target.
    pub(crate) saved: Option<Prologue>,
    pub(crate) data: Option<Payload>,
}

impl OverrideRecord {
    fn deficiency(&self, target: &Target) -> Option<Failure> {
        let expected = self.quota.limit()?;
        (self.calls < expected).then(|| Failure::Deficiency {
            target: target.name().to_string(),
            calls: self.calls,
            expected,
        })
    }
}

pub(crate) struct Slot {
    pub(crate) target: Target,
    pub(crate) always: Option<OverrideRecord>,
    pub(crate) chain: VecDeque<OverrideRecord>,
}

impl Slot {
    fn existing_quota(&self) -> Option<Quota> {
        self.always
            .as_ref()
            .or_else(|| self.chain.front())
            .map(|r| r.quota)
    }

    fn is_empty(&self) -> bool {
        self.always.is_none() && self.chain.is_empty()
    }

    /// The target together with the record that is (or should be) installed.
    pub(crate) fn split_active(&mut self) -> (&Target, Option<&mut OverrideRecord>) {
        let active = match self.always {
            Some(ref mut record) => Some(record),
            None => self.chain.front_mut(),
        };
        (&self.target, active)
    }

    fn records(&self) -> impl Iterator<Item = &OverrideRecord> {
        self.always.iter().chain(self.chain.iter())
    }
}

/// Override bookkeeping for one session, generic over how code is patched.
pub struct ChainTable<P: CodePatcher> {
    patcher: P,
    pub(crate) slots: Vec<Slot>,
    next_id: u64,
    pub(crate) failures: Vec<Failure>,
    /// Every replacement ever requested, for naming late calls to it.
    names: HashMap<usize, String>,
}

impl<P: CodePatcher> ChainTable<P> {
    pub fn new(patcher: P) -> Self {
        Self {
            patcher,
            slots: Vec::new(),
            next_id: 0,
            failures: Vec::new(),
            names: HashMap::new(),
        }
    }

    pub fn patcher(&self) -> &P {
        &self.patcher
    }

    fn slot_index(&self, address: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.target.address() == address)
    }

    fn install(patcher: &mut P, target: &Target, record: &mut OverrideRecord) -> std::result::Result<(), PatchError> {
        // SAFETY: `target` came from `Target::resolve`/`from_address` and the
        // replacement from a shim of the same signature.
        let saved = unsafe { patcher.install(target.address(), record.replacement)? };
        record.saved = Some(saved);
        debug!(
            "installed override {} of `{}` -> `{}` ({})",
            record.id, target, record.replacement_name, record.quota
        );
        Ok(())
    }

    fn uninstall(patcher: &mut P, target: &Target, record: &mut OverrideRecord) -> std::result::Result<(), PatchError> {
        // The saved bytes stay on the record until they are back in place.
        if let Some(saved) = record.saved {
            // SAFETY: `saved` is what `install` captured for this target.
            unsafe { patcher.restore(target.address(), &saved)? };
            record.saved = None;
            debug!("removed override {} of `{}` after {} call(s)", record.id, target, record.calls);
        }
        Ok(())
    }

    /// Register an override of `target`.
    ///
    /// `Always` overrides and the first override of an idle target are
    /// installed at once; the rest queue behind the active one.
    pub fn request(&mut self, target: Target, request: Request) -> Result<OverrideId> {
        let shared = self.slots.iter().any(|slot| {
            slot.target.address() != target.address()
                && slot.records().any(|r| r.replacement == request.replacement)
        });
        if shared {
            return Err(OverrideError::SharedReplacement(request.replacement));
        }

        let index = match self.slot_index(target.address()) {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    target,
                    always: None,
                    chain: VecDeque::new(),
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        if let Some(existing) = slot.existing_quota() {
            if request.quota.is_always() || existing.is_always() {
                let err = OverrideError::QuotaConflict {
                    target: slot.target.name().to_string(),
                    requested: request.quota,
                    existing,
                };
                return Err(err);
            }
        }

        self.next_id += 1;
        let mut record = OverrideRecord {
            id: OverrideId(self.next_id),
            replacement: request.replacement,
            replacement_name: request.replacement_name,
            quota: request.quota,
            calls: 0,
            saved: None,
            data: request.data,
        };
        let id = record.id;

        if slot.is_empty() {
            if let Err(e) = Self::install(&mut self.patcher, &slot.target, &mut record) {
                self.slots.remove(index);
                return Err(e.into());
            }
        } else {
            debug!("queued override {} of `{}` ({})", id, slot.target, record.quota);
        }
        self.names
            .entry(record.replacement)
            .or_insert_with(|| record.replacement_name.clone());

        if record.quota.is_always() {
            slot.always = Some(record);
        } else {
            slot.chain.push_back(record);
        }
        Ok(id)
    }

    /// Retire the exhausted head of the chain for `address` and install the
    /// next one, if any.
    pub(crate) fn advance(&mut self, address: usize) -> Result<()> {
        let Some(index) = self.slot_index(address) else {
            return Err(OverrideError::NotOverridden(format!("{:#x}", address)));
        };
        let slot = &mut self.slots[index];
        if let Some(head) = slot.chain.front_mut() {
            Self::uninstall(&mut self.patcher, &slot.target, head)?;
            slot.chain.pop_front();
        }
        if let Some(next) = slot.chain.front_mut() {
            Self::install(&mut self.patcher, &slot.target, next)?;
        }
        if slot.is_empty() {
            self.slots.remove(index);
        }
        Ok(())
    }

    /// Take overrides off `target` before they run out.
    ///
    /// `First` drops the `Always` override or else the chain head and lets
    /// the next queued override take over; `All` clears the target.
    /// Removed overrides are not reported as under-called.
    pub fn remove(&mut self, target: &Target, mode: RemoveMode) -> Result<()> {
        let index = self
            .slot_index(target.address())
            .ok_or_else(|| OverrideError::NotOverridden(target.name().to_string()))?;

        match mode {
            RemoveMode::First => {
                let slot = &mut self.slots[index];
                if let Some(always) = slot.always.as_mut() {
                    Self::uninstall(&mut self.patcher, &slot.target, always)?;
                    slot.always = None;
                } else {
                    self.advance(target.address())?;
                    return Ok(());
                }
            }
            RemoveMode::All => {
                let slot = &mut self.slots[index];
                if let (target, Some(active)) = slot.split_active() {
                    Self::uninstall(&mut self.patcher, target, active)?;
                }
                slot.always = None;
                slot.chain.clear();
            }
        }
        if self.slots[index].is_empty() {
            self.slots.remove(index);
        }
        Ok(())
    }

    pub(crate) fn record_failure(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    /// Restore every patched target and report what went unmet.
    ///
    /// All targets are restored even if one fails; the first patch error is
    /// then returned and the collected failures are discarded. Targets that
    /// could not be restored stay in the table, so teardown can be retried.
    pub fn teardown(&mut self) -> Result<Vec<Failure>> {
        let mut first_error = None;
        let mut failures = std::mem::take(&mut self.failures);

        for mut slot in std::mem::take(&mut self.slots) {
            let restored = match slot.split_active() {
                (target, Some(active)) => match Self::uninstall(&mut self.patcher, target, active) {
                    Ok(()) => true,
                    Err(e) => {
                        first_error.get_or_insert(e);
                        false
                    }
                },
                (_, None) => true,
            };
            if !restored {
                self.slots.push(slot);
                continue;
            }
            failures.extend(slot.chain.iter().filter_map(|r| r.deficiency(&slot.target)));
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(failures),
        }
    }

    pub(crate) fn replacement_name(&self, replacement: usize) -> Option<&str> {
        self.names.get(&replacement).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Replacement currently written into `address`, if any.
    pub fn installed_replacement(&self, address: usize) -> Option<usize> {
        let slot = &self.slots[self.slot_index(address)?];
        slot.always
            .as_ref()
            .or_else(|| slot.chain.front())
            .filter(|r| r.saved.is_some())
            .map(|r| r.replacement)
    }

    /// Overrides registered for `address`, active one included.
    pub fn pending(&self, address: usize) -> usize {
        self.slot_index(address)
            .map_or(0, |i| self.slots[i].records().count())
    }

    /// Calls absorbed so far by override `id`, while it is still registered.
    pub fn calls(&self, id: OverrideId) -> Option<u32> {
        self.slots
            .iter()
            .flat_map(|s| s.records())
            .find(|r| r.id == id)
            .map(|r| r.calls)
    }
}

impl<P: CodePatcher> Drop for ChainTable<P> {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            if let Err(e) = self.teardown() {
                log::error!("restoring overridden functions failed: {}", e);
            }
        }
    }
}
