use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::request::TargetKey;

use super::delivery::Slot;

/// Shared map of target keys with a request in flight.
///
/// Every check-and-modify happens under one lock acquisition, so a
/// registration can never interleave with a concurrent registration or
/// release for the same key. Only the orchestrator adds entries.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<TargetKey, Weak<Slot>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TargetKey, Weak<Slot>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert-if-absent. Returns false when `key` already has a live request.
    pub(crate) fn try_register(&self, key: &TargetKey, slot: &Arc<Slot>) -> bool {
        let mut entries = self.entries();
        match entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(slot));
                true
            }
            // A slot that no longer exists cannot resolve; reclaim its key.
            Entry::Occupied(mut occupied) if occupied.get().strong_count() == 0 => {
                occupied.insert(Arc::downgrade(slot));
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove `key` only if it still belongs to `slot`.
    pub(crate) fn release(&self, key: &TargetKey, slot: &Slot) -> bool {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(weak) if std::ptr::eq(weak.as_ptr(), slot) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn lookup(&self, key: &TargetKey) -> Option<Arc<Slot>> {
        self.entries().get(key).and_then(Weak::upgrade)
    }

    pub fn is_pending(&self, key: &TargetKey) -> bool {
        self.lookup(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
