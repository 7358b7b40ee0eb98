//! Watcher event translation.
//!
//! `kube::runtime::watcher` reports `Applied`, `Deleted` and whole `Restarted`
//! listings. The tracker keeps the last-known object per identity so it can
//! tell adds from updates, drop deletes for objects it never announced, and
//! turn a relist into the add/update/delete events that reconcile it.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use metrics::counter;
use podsync_core::{FeedEvent, Identity, RemoteObject, ShapeError};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error};

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Identity of a pod as reported by the API; `None` when it has no name.
pub fn identity_of(pod: &Pod) -> Option<Identity> {
    let name = pod.metadata.name.as_deref().filter(|n| !n.is_empty())?;
    Some(Identity::new(pod.metadata.namespace.clone().unwrap_or_default(), name))
}

/// Owned raw copy of a pod, without `metadata.managedFields`.
pub fn remote_object(pod: &Pod) -> Result<RemoteObject, ShapeError> {
    let mut raw = serde_json::to_value(pod)?;
    strip_managed_fields(&mut raw);
    RemoteObject::from_raw(raw)
}

fn convert(pod: &Pod) -> Option<RemoteObject> {
    match remote_object(pod) {
        Ok(o) => Some(o),
        Err(e) => {
            counter!("feed_skipped_objects_total", 1u64);
            error!(error = %e, uid = ?pod.metadata.uid, "skipping uninterpretable pod");
            None
        }
    }
}

/// Last-known object per identity, used to classify watcher events.
///
/// The tracker owns a full copy of every tracked pod (the consumer's store holds
/// another), and `resync` clones all of them into one batch per period. Memory
/// for a selector is therefore about twice its raw object size.
#[derive(Debug, Default)]
pub struct FeedTracker {
    known: FxHashMap<Identity, RemoteObject>,
}

impl FeedTracker {
    pub fn len(&self) -> usize { self.known.len() }
    pub fn is_empty(&self) -> bool { self.known.is_empty() }

    pub fn observe(&mut self, event: Event<Pod>) -> Vec<FeedEvent> {
        match event {
            Event::Applied(pod) => convert(&pod).map(|o| self.upsert(o)).into_iter().collect(),
            Event::Deleted(pod) => self.deleted(&pod).into_iter().collect(),
            Event::Restarted(pods) => self.restarted(&pods),
        }
    }

    /// Re-deliver every known object as an update, then mark the pass complete.
    pub fn resync(&self) -> Vec<FeedEvent> {
        let mut out: Vec<FeedEvent> = self.known.values().cloned().map(FeedEvent::Updated).collect();
        out.push(FeedEvent::Resynced);
        out
    }

    fn upsert(&mut self, obj: RemoteObject) -> FeedEvent {
        match self.known.insert(obj.identity.clone(), obj.clone()) {
            Some(_) => FeedEvent::Updated(obj),
            None => FeedEvent::Added(obj),
        }
    }

    fn deleted(&mut self, pod: &Pod) -> Option<FeedEvent> {
        let Some(id) = identity_of(pod) else {
            counter!("feed_skipped_objects_total", 1u64);
            error!(uid = ?pod.metadata.uid, "delete for pod without name");
            return None;
        };
        if self.known.remove(&id).is_some() {
            Some(FeedEvent::Deleted(id))
        } else {
            debug!(key = %id, "delete for unannounced pod dropped");
            None
        }
    }

    fn restarted(&mut self, pods: &[Pod]) -> Vec<FeedEvent> {
        let mut out = Vec::with_capacity(pods.len() + 1);
        let mut listed = FxHashSet::default();
        for pod in pods {
            if let Some(id) = identity_of(pod) {
                listed.insert(id);
            }
            let Some(obj) = convert(pod) else { continue };
            if self.known.get(&obj.identity) == Some(&obj) {
                continue;
            }
            out.push(self.upsert(obj));
        }
        let vanished: Vec<Identity> = self.known.keys().filter(|k| !listed.contains(*k)).cloned().collect();
        for id in vanished {
            self.known.remove(&id);
            out.push(FeedEvent::Deleted(id));
        }
        out.push(FeedEvent::Resynced);
        out
    }
}
