//! Ferry schema: which CustomResourceDefinition serves a kind, and whether it is ready.

#![forbid(unsafe_code)]

use ferry_core::{Gvk, Result};
use ferry_kubehub::{ClusterApi, Target};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::debug;

pub fn crd_gvk() -> Gvk { Gvk::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition") }

/// What the executor needs to know about a CRD while waiting on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdInfo {
    pub name: String,
    pub group: String,
    pub kind: String,
    pub plural: String,
    pub served_versions: SmallVec<[String; 4]>,
    pub accepted_plural: Option<String>,
    pub established: bool,
}

impl CrdInfo {
    /// Read from an unstructured CRD object; missing fields read as empty.
    pub fn from_value(v: &Value) -> Self {
        let s = |p: &str| v.pointer(p).and_then(Value::as_str).unwrap_or_default().to_string();
        let served_versions = v
            .pointer("/spec/versions")
            .and_then(Value::as_array)
            .map(|vs| {
                vs.iter()
                    .filter(|ver| ver.get("served").and_then(Value::as_bool).unwrap_or(false))
                    .filter_map(|ver| ver.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let established = v
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .map(|cs| {
                cs.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Established") && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
            .unwrap_or(false);
        Self {
            name: s("/metadata/name"),
            group: s("/spec/group"),
            kind: s("/spec/names/kind"),
            plural: s("/spec/names/plural"),
            served_versions,
            accepted_plural: v.pointer("/status/acceptedNames/plural").and_then(Value::as_str).map(str::to_string),
            established,
        }
    }

    pub fn serves(&self, gvk: &Gvk) -> bool {
        self.group == gvk.group && self.kind == gvk.kind && self.served_versions.iter().any(|v| *v == gvk.version)
    }

    /// Established, or at least accepted under the plural it declares.
    pub fn is_ready(&self) -> bool {
        self.established || self.accepted_plural.as_deref().is_some_and(|p| !p.is_empty() && p == self.plural)
    }
}

/// Find the CRD serving `gvk`. `Ok(None)` for built-in groups and unknown kinds.
pub async fn find_crd(cluster: &dyn ClusterApi, gvk: &Gvk) -> Result<Option<CrdInfo>> {
    if gvk.group.is_empty() || !gvk.group.contains('.') {
        return Ok(None);
    }
    let target = Target::new(cluster.resolve(&crd_gvk()).await?, "");
    let items = cluster.list(&target, "").await?;
    for raw in items {
        let info = CrdInfo::from_value(&raw);
        if info.serves(gvk) {
            debug!(crd = %info.name, established = info.established, "found crd for kind");
            return Ok(Some(info));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crd(status: Value) -> Value {
        json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {
                "group": "example.com",
                "scope": "Namespaced",
                "names": {"kind": "Widget", "plural": "widgets"},
                "versions": [
                    {"name": "v1", "served": true, "storage": true},
                    {"name": "v1alpha1", "served": false, "storage": false}
                ]
            },
            "status": status
        })
    }

    #[test]
    fn serves_only_served_versions() {
        let info = CrdInfo::from_value(&crd(json!({})));
        assert!(info.serves(&Gvk::new("example.com", "v1", "Widget")));
        assert!(!info.serves(&Gvk::new("example.com", "v1alpha1", "Widget")));
        assert!(!info.is_ready());
    }

    #[test]
    fn readiness_from_conditions_or_accepted_names() {
        let established = CrdInfo::from_value(&crd(json!({
            "conditions": [{"type": "Established", "status": "True"}],
            "acceptedNames": {"kind": "", "plural": ""},
            "storedVersions": ["v1"]
        })));
        assert!(established.is_ready());
        let accepted = CrdInfo::from_value(&crd(json!({
            "acceptedNames": {"kind": "Widget", "plural": "widgets"},
            "storedVersions": ["v1"]
        })));
        assert!(accepted.is_ready());
    }
}
