//! podsync core types: identities, feed events, filter and snapshot records

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod projector;

pub use projector::{is_ready, project, PodCondition, Projection};

/// Stable identity of a workload unit across its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Errors raised when an object delivered by the feed cannot be interpreted.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("object {key}: undecodable status: {source}")]
    Status {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding object: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Opaque object as delivered by a change feed. The raw JSON is owned; no
/// aliases into the feed's buffers survive past the event that carried it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub identity: Identity,
    pub raw: serde_json::Value,
}

impl RemoteObject {
    /// Wrap a raw object, reading its identity from `metadata`.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, ShapeError> {
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ShapeError::MissingName)?
            .to_string();
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self { identity: Identity { namespace, name }, raw })
    }
}

/// Typed events produced by a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(RemoteObject),
    Updated(RemoteObject),
    Deleted(Identity),
    /// The feed finished a full listing pass; any drift has already surfaced
    /// as ordinary events.
    Resynced,
}

impl FeedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Added(_) => "add",
            FeedEvent::Updated(_) => "update",
            FeedEvent::Deleted(_) => "delete",
            FeedEvent::Resynced => "resync",
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            FeedEvent::Added(o) | FeedEvent::Updated(o) => Some(&o.identity),
            FeedEvent::Deleted(id) => Some(id),
            FeedEvent::Resynced => None,
        }
    }
}

/// Which remote objects are in scope.
///
/// - `namespace`: empty means all namespaces
/// - `label_selector`: empty matches every object, e.g. `app=miniapi,tier=backend`
/// - `resync_interval`: `None` (or zero) disables periodic resync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub namespace: String,
    pub label_selector: String,
    pub resync_interval: Option<Duration>,
}

impl FilterSpec {
    /// Effective resync period; zero is treated as disabled.
    pub fn resync_period(&self) -> Option<Duration> {
        self.resync_interval.filter(|d| !d.is_zero())
    }
}

/// Consumer-facing flattened pod record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub ready: bool,
}

/// Last delivered projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: u64,
    pub pods: Vec<PodRecord>,
}

pub mod prelude {
    pub use super::{FeedEvent, FilterSpec, Identity, PodRecord, RemoteObject, ShapeError, Snapshot};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_metadata() {
        let o = RemoteObject::from_raw(serde_json::json!({
            "metadata": { "name": "p1", "namespace": "default" }
        }))
        .unwrap();
        assert_eq!(o.identity, Identity::new("default", "p1"));
        assert_eq!(o.identity.to_string(), "default/p1");
    }

    #[test]
    fn missing_name_is_a_shape_error() {
        let err = RemoteObject::from_raw(serde_json::json!({ "metadata": { "namespace": "default" } }));
        assert!(matches!(err, Err(ShapeError::MissingName)));
        let err = RemoteObject::from_raw(serde_json::json!("not-an-object"));
        assert!(matches!(err, Err(ShapeError::MissingName)));
    }

    #[test]
    fn cluster_key_without_namespace() {
        assert_eq!(Identity::new("", "solo").to_string(), "solo");
    }

    #[test]
    fn zero_resync_is_disabled() {
        let f = FilterSpec { resync_interval: Some(Duration::ZERO), ..Default::default() };
        assert_eq!(f.resync_period(), None);
        let f = FilterSpec { resync_interval: Some(Duration::from_secs(30)), ..Default::default() };
        assert_eq!(f.resync_period(), Some(Duration::from_secs(30)));
    }
}
