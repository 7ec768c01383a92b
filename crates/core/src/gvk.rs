//! Group/version/kind identity and the closed set of workload kinds.

use serde::{Deserialize, Serialize};

use crate::{FerryError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(FerryError::bad_input(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    /// Build from an object's `apiVersion` and `kind` fields.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Read `apiVersion`/`kind` from an unstructured object.
    pub fn of(obj: &serde_json::Value) -> Result<Self> {
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        if api_version.is_empty() || kind.is_empty() {
            return Err(FerryError::internal("object is missing apiVersion or kind"));
        }
        Ok(Self::from_api_version(api_version, kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn is(&self, group: &str, kind: &str) -> bool { self.group == group && self.kind == kind }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.key()) }
}

/// Workload-controller kinds the engine knows how to wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Pod,
}

impl WorkloadKind {
    pub fn from_gvk(gvk: &Gvk) -> Option<Self> {
        match (gvk.group.as_str(), gvk.kind.as_str()) {
            ("apps", "Deployment") => Some(Self::Deployment),
            ("apps", "StatefulSet") => Some(Self::StatefulSet),
            ("apps", "DaemonSet") => Some(Self::DaemonSet),
            ("", "Pod") => Some(Self::Pod),
            _ => None,
        }
    }

    pub fn gvk(self) -> Gvk {
        match self {
            Self::Deployment => Gvk::new("apps", "v1", "Deployment"),
            Self::StatefulSet => Gvk::new("apps", "v1", "StatefulSet"),
            Self::DaemonSet => Gvk::new("apps", "v1", "DaemonSet"),
            Self::Pod => Gvk::new("", "v1", "Pod"),
        }
    }

    /// Path to the pod spec inside the object.
    pub fn pod_spec_pointer(self) -> &'static str {
        match self {
            Self::Pod => "/spec",
            Self::Deployment | Self::StatefulSet | Self::DaemonSet => "/spec/template/spec",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_core_and_grouped() {
        assert_eq!(Gvk::parse("v1/ConfigMap").unwrap(), Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(Gvk::parse("apps/v1/Deployment").unwrap(), Gvk::new("apps", "v1", "Deployment"));
        assert!(Gvk::parse("invalid").is_err());
        assert!(Gvk::parse("").is_err());
        assert!(Gvk::parse("a/b/c/d").is_err());
    }

    #[test]
    fn api_version_roundtrip() {
        let g = Gvk::from_api_version("rbac.authorization.k8s.io/v1", "ClusterRoleBinding");
        assert_eq!(g.group, "rbac.authorization.k8s.io");
        assert_eq!(g.api_version(), "rbac.authorization.k8s.io/v1");
        assert_eq!(Gvk::from_api_version("v1", "Pod").api_version(), "v1");
    }

    #[test]
    fn workload_kinds_are_closed() {
        assert_eq!(WorkloadKind::from_gvk(&Gvk::new("apps", "v1", "DaemonSet")), Some(WorkloadKind::DaemonSet));
        assert_eq!(WorkloadKind::from_gvk(&Gvk::new("", "v1", "Pod")), Some(WorkloadKind::Pod));
        assert_eq!(WorkloadKind::from_gvk(&Gvk::new("batch", "v1", "Job")), None);
        assert_eq!(WorkloadKind::Pod.pod_spec_pointer(), "/spec");
    }
}
