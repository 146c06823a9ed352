//! Local instance directory.
//!
//! A keyed map from `(type, id)` to the live instance handle. The entry API
//! makes the claim atomic: two racing activations resolve to exactly one
//! winner, and the loser adopts the winning handle. Handles carry an epoch
//! so a stopping instance only evicts itself, never a successor that reused
//! its name.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use store::EntityKey;

use crate::instance::LocalHandle;

/// Result of an atomic name claim. A lost claim hands back a detached clone
/// of the winning handle, never a map guard.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Claim {
    Won,
    Lost(LocalHandle),
}

impl std::fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandle")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl PartialEq for LocalHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.epoch == other.epoch
    }
}

impl Eq for LocalHandle {}

#[derive(Default)]
pub struct LocalRegistry {
    instances: DashMap<EntityKey, LocalHandle>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<LocalHandle> {
        self.instances.get(key).map(|h| h.clone())
    }

    /// Atomically bind `handle` to its key. Exactly one of two concurrent
    /// claims wins; the loser gets the registered handle back.
    pub(crate) fn claim(&self, handle: LocalHandle) -> Claim {
        match self.instances.entry(handle.key.clone()) {
            Entry::Occupied(existing) => Claim::Lost(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Claim::Won
            }
        }
    }

    /// Remove the binding only while it still belongs to `epoch`.
    pub fn remove_if_epoch(&self, key: &EntityKey, epoch: u64) {
        self.instances
            .remove_if(key, |_, handle| handle.epoch == epoch);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Snapshot of every live handle, used at shutdown.
    pub fn drain_handles(&self) -> Vec<LocalHandle> {
        let handles: Vec<LocalHandle> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.instances.clear();
        handles
    }
}
