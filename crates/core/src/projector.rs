//! Snapshot projection: opaque store contents to flattened pod records.
//!
//! Projection is pure. Objects whose status cannot be decoded are reported in
//! [`Projection::errors`] and left out of the record list; the remaining
//! objects are still projected.

use serde::Deserialize;

use crate::{PodRecord, RemoteObject, ShapeError};

/// One entry of `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

impl PodCondition {
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self { type_: type_.into(), status: status.into() }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusView {
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    conditions: Option<Vec<PodCondition>>,
}

/// Result of projecting a set of objects.
#[derive(Debug, Default)]
pub struct Projection {
    pub pods: Vec<PodRecord>,
    pub errors: Vec<ShapeError>,
}

/// Ready iff a `Ready` condition with status `True` is present.
pub fn is_ready(conditions: &[PodCondition]) -> bool {
    conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True")
}

fn project_one(obj: &RemoteObject) -> Result<PodRecord, ShapeError> {
    let status = match obj.raw.get("status") {
        None | Some(serde_json::Value::Null) => PodStatusView::default(),
        Some(v) => PodStatusView::deserialize(v)
            .map_err(|source| ShapeError::Status { key: obj.identity.to_string(), source })?,
    };
    let conditions = status.conditions.unwrap_or_default();
    Ok(PodRecord {
        namespace: obj.identity.namespace.clone(),
        name: obj.identity.name.clone(),
        ip: status.pod_ip.unwrap_or_default(),
        ready: is_ready(&conditions),
    })
}

/// Project every object, in input order.
pub fn project<'a, I>(objects: I) -> Projection
where
    I: IntoIterator<Item = &'a RemoteObject>,
{
    let iter = objects.into_iter();
    let mut out = Projection { pods: Vec::with_capacity(iter.size_hint().0), errors: Vec::new() };
    for obj in iter {
        match project_one(obj) {
            Ok(p) => out.pods.push(p),
            Err(e) => out.errors.push(e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, status: serde_json::Value) -> RemoteObject {
        RemoteObject::from_raw(json!({
            "metadata": { "name": name, "namespace": "default" },
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn readiness_requires_ready_true() {
        assert!(!is_ready(&[]));
        assert!(!is_ready(&[PodCondition::new("Ready", "False")]));
        assert!(!is_ready(&[PodCondition::new("Ready", "Unknown")]));
        assert!(is_ready(&[PodCondition::new("Ready", "True")]));
        assert!(is_ready(&[
            PodCondition::new("Initialized", "True"),
            PodCondition::new("ContainersReady", "False"),
            PodCondition::new("PodScheduled", "True"),
            PodCondition::new("Ready", "True"),
        ]));
        // ContainersReady alone does not make the pod ready
        assert!(!is_ready(&[PodCondition::new("ContainersReady", "True")]));
    }

    #[test]
    fn projects_ip_and_readiness() {
        let objs = vec![
            pod("p1", json!({ "podIP": "10.0.0.1", "conditions": [{ "type": "Ready", "status": "True" }] })),
            pod("p2", json!({ "podIP": "10.0.0.2", "conditions": [] })),
        ];
        let out = project(&objs);
        assert!(out.errors.is_empty());
        assert_eq!(
            out.pods,
            vec![
                PodRecord { namespace: "default".into(), name: "p1".into(), ip: "10.0.0.1".into(), ready: true },
                PodRecord { namespace: "default".into(), name: "p2".into(), ip: "10.0.0.2".into(), ready: false },
            ]
        );
    }

    #[test]
    fn pending_pod_without_status() {
        let obj = RemoteObject::from_raw(json!({ "metadata": { "name": "pending", "namespace": "ns" } })).unwrap();
        let out = project([&obj]);
        assert_eq!(out.pods.len(), 1);
        assert_eq!(out.pods[0].ip, "");
        assert!(!out.pods[0].ready);
        let nulls = pod("nulls", json!({ "podIP": null, "conditions": null }));
        let out = project([&nulls]);
        assert_eq!(out.pods[0].ip, "");
        assert!(!out.pods[0].ready);
    }

    #[test]
    fn malformed_object_is_skipped() {
        let objs = vec![
            pod("good", json!({ "podIP": "10.0.0.7" })),
            pod("bad", json!({ "conditions": "Ready" })),
            pod("also-good", json!({ "podIP": "10.0.0.8" })),
        ];
        let out = project(&objs);
        let names: Vec<_> = out.pods.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["good", "also-good"]);
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(&out.errors[0], ShapeError::Status { key, .. } if key == "default/bad"));
    }

    #[test]
    fn empty_input_projects_empty() {
        let out = project(std::iter::empty());
        assert!(out.pods.is_empty());
        assert!(out.errors.is_empty());
    }
}
