//! podsync store: latest known state of every in-scope object, keyed by identity

#![forbid(unsafe_code)]

use podsync_core::prelude::*;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Identity-keyed object store. Every operation is idempotent per identity:
/// adding a present identity overwrites it, deleting an absent one is a no-op.
#[derive(Debug, Default)]
pub struct LocalStore {
    map: FxHashMap<Identity, RemoteObject>,
}

impl LocalStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn get(&self, id: &Identity) -> Option<&RemoteObject> { self.map.get(id) }

    pub fn apply_add(&mut self, obj: RemoteObject) {
        if let Some(prev) = self.map.insert(obj.identity.clone(), obj) {
            trace!(key = %prev.identity, "add replaced existing object");
        }
    }

    pub fn apply_update(&mut self, obj: RemoteObject) {
        self.map.insert(obj.identity.clone(), obj);
    }

    pub fn apply_delete(&mut self, id: &Identity) {
        if self.map.remove(id).is_none() {
            trace!(key = %id, "delete for unknown object");
        }
    }

    /// Apply one feed event. `Resynced` carries no object and leaves the store untouched.
    pub fn apply(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Added(o) => self.apply_add(o),
            FeedEvent::Updated(o) => self.apply_update(o),
            FeedEvent::Deleted(id) => self.apply_delete(&id),
            FeedEvent::Resynced => {}
        }
    }

    /// All objects in unspecified order.
    pub fn list_all(&self) -> impl Iterator<Item = &RemoteObject> + '_ {
        self.map.values()
    }
}
