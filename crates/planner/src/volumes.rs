//! Pod volumes and mounts, plus the objects some volume kinds need.

use std::collections::{BTreeMap, BTreeSet};

use ferry_core::naming::{label_like, volume_name, KIND_STATIC_CONFIG, LABEL_KIND};
use ferry_core::{
    ConfigurableEntry, DeploymentTarget, EntrySource, FerryError, FileContents, Mount, OpApply, Operation, Result,
    Volume, VolumeKind,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::secrets::SecretCollector;

/// Materialized volumes for one pod.
#[derive(Debug, Default)]
pub struct PodVolumes {
    pub volumes: Vec<Value>,
    pub ops: Vec<Operation>,
    known: BTreeSet<String>,
    skipped: BTreeSet<String>,
}

/// Shared metadata stamped on every object a volume brings along.
pub struct ObjectMeta<'a> {
    pub namespace: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    pub annotations: &'a BTreeMap<String, String>,
}

impl ObjectMeta<'_> {
    fn render(&self, name: &str, extra_labels: &[(&str, &str)]) -> Value {
        let mut labels = self.labels.clone();
        labels.extend(extra_labels.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        json!({"name": name, "namespace": self.namespace, "labels": labels, "annotations": self.annotations})
    }
}

impl PodVolumes {
    pub fn materialize(target: &DeploymentTarget, meta: &ObjectMeta<'_>, volumes: &[Volume], secrets: &mut SecretCollector<'_>) -> Result<Self> {
        let mut out = Self::default();
        for v in volumes {
            let name = volume_name(&v.name);
            match &v.kind {
                VolumeKind::Ephemeral => out.push(json!({"name": name, "emptyDir": {}})),
                VolumeKind::HostPath { directory } => {
                    out.push(json!({"name": name, "hostPath": {"path": directory, "type": "DirectoryOrCreate"}}))
                }
                VolumeKind::Persistent { id, size_bytes } => {
                    if id.is_empty() {
                        return Err(FerryError::bad_input(format!("{}: persistent volume requires an id", v.name)));
                    }
                    let size = quantity(*size_bytes);
                    if target.env.ephemeral {
                        out.push(json!({"name": name, "emptyDir": {"sizeLimit": size}}));
                        continue;
                    }
                    let claim = label_like(&format!("pv-{}", id));
                    let pvc = json!({
                        "apiVersion": "v1",
                        "kind": "PersistentVolumeClaim",
                        "metadata": meta.render(&claim, &[]),
                        "spec": {"accessModes": ["ReadWriteOnce"], "resources": {"requests": {"storage": size}}},
                    });
                    let desc = format!("Persistent storage for {} ({})", v.owner, size);
                    out.ops.push(Operation::new(desc, &OpApply { resource: Some(pvc), ..Default::default() })?);
                    out.push(json!({"name": name, "persistentVolumeClaim": {"claimName": claim}}));
                }
                VolumeKind::WorkspaceSync { .. } => {
                    debug!(volume = %v.name, "workspace sync volumes are handled out of band");
                    out.skipped.insert(v.name.clone());
                }
                VolumeKind::Configurable { entries } => {
                    let projected = project(meta, entries, secrets, &mut out.ops)?;
                    out.push(json!({"name": name, "projected": {"sources": projected}}));
                }
            }
            out.known.insert(v.name.clone());
        }
        Ok(out)
    }

    fn push(&mut self, v: Value) { self.volumes.push(v) }

    /// Volumes contributed verbatim by extensions.
    pub fn push_raw(&mut self, v: Value) { self.volumes.push(v) }

    /// Container mounts for the given declarations. Workspace-sync volumes are skipped.
    pub fn mounts(&self, mounts: &[Mount]) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for m in mounts {
            let vol = m.volume.as_deref().ok_or_else(|| FerryError::internal(format!("{}: mount has no volume", m.path)))?;
            if self.skipped.contains(vol) {
                continue;
            }
            if !self.known.contains(vol) {
                return Err(FerryError::internal(format!("{}: mount refers to unknown volume {:?}", m.path, vol)));
            }
            if m.path.is_empty() {
                return Err(FerryError::internal(format!("{}: mount has no path", vol)));
            }
            out.push(json!({"name": volume_name(vol), "mountPath": m.path, "readOnly": m.readonly}));
        }
        Ok(out)
    }
}

/// Projected sources for a configurable volume. Inline contents share one
/// content-addressed ConfigMap.
fn project(meta: &ObjectMeta<'_>, entries: &[ConfigurableEntry], secrets: &mut SecretCollector<'_>, ops: &mut Vec<Operation>) -> Result<Vec<Value>> {
    let mut inline: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut sources = Vec::new();
    let mut add_inline = |path: &str, f: &FileContents| {
        let rel = if f.path.is_empty() { path.to_string() } else { format!("{}/{}", path.trim_end_matches('/'), f.path) };
        inline.insert(config_key(&rel), (rel, f.contents.clone()));
    };
    for e in entries {
        match &e.source {
            EntrySource::Inline(f) => add_inline(&e.path, &FileContents { path: String::new(), contents: f.contents.clone() }),
            EntrySource::InlineSet(files) => files.iter().for_each(|f| add_inline(&e.path, f)),
            EntrySource::SecretRef(name) => {
                let alloc = secrets.allocate(name)?;
                sources.push(json!({"secret": {"name": alloc.name, "items": [{"key": alloc.key, "path": e.path}]}}));
            }
            EntrySource::KubernetesSecret { name, key } => {
                sources.push(json!({"secret": {"name": name, "items": [{"key": key, "path": e.path}]}}));
            }
        }
    }
    if !inline.is_empty() {
        let name = static_config_name(inline.iter().map(|(k, (_, c))| (k.as_str(), c.as_bytes())));
        let data: BTreeMap<&str, &str> = inline.iter().map(|(k, (_, c))| (k.as_str(), c.as_str())).collect();
        let items: Vec<Value> = inline.iter().map(|(k, (p, _))| json!({"key": k, "path": p})).collect();
        let cm = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": meta.render(&name, &[(LABEL_KIND, KIND_STATIC_CONFIG)]),
            "immutable": true,
            "data": data,
        });
        ops.push(Operation::new("Static configuration", &OpApply { resource: Some(cm), ..Default::default() })?);
        sources.insert(0, json!({"configMap": {"name": name, "items": items}}));
    }
    Ok(sources)
}

fn config_key(path: &str) -> String {
    path.trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

/// Same contents, same name.
pub fn static_config_name<'a>(entries: impl Iterator<Item = (&'a str, &'a [u8])>) -> String {
    let mut h = Sha256::new();
    for (k, bytes) in entries {
        h.update(k.as_bytes());
        h.update(b":");
        h.update(bytes);
        h.update(b"\n");
    }
    format!("ferry-static-{}", &hex::encode(h.finalize())[..20])
}

/// Byte count as a cluster quantity, in the largest binary unit that divides it.
pub fn quantity(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "Gi"), (1 << 20, "Mi"), (1 << 10, "Ki")];
    for (size, suffix) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{}", bytes / size, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::Environment;

    fn vol(name: &str, kind: VolumeKind) -> Volume { Volume { name: name.into(), owner: "api".into(), kind } }

    fn materialize(ephemeral: bool, volumes: &[Volume]) -> Result<PodVolumes> {
        let target = DeploymentTarget { namespace: "shop".into(), env: Environment { ephemeral, ..Default::default() } };
        let (labels, annotations) = (BTreeMap::new(), BTreeMap::new());
        let meta = ObjectMeta { namespace: "shop", labels: &labels, annotations: &annotations };
        PodVolumes::materialize(&target, &meta, volumes, &mut SecretCollector::new(None, "m".into()))
    }

    #[test]
    fn persistent_volume_depends_on_environment() {
        let vols = [vol("data", VolumeKind::Persistent { id: "Data".into(), size_bytes: 2 << 30 })];
        let eph = materialize(true, &vols).unwrap();
        assert!(eph.ops.is_empty());
        assert_eq!(eph.volumes[0]["emptyDir"]["sizeLimit"], "2Gi");

        let prod = materialize(false, &vols).unwrap();
        assert_eq!(prod.ops.len(), 1);
        assert_eq!(prod.ops[0].description, "Persistent storage for api (2Gi)");
        assert_eq!(prod.volumes[0]["persistentVolumeClaim"]["claimName"], "pv-data");
        let pvc = prod.ops[0].resource().unwrap();
        assert_eq!(pvc["spec"]["accessModes"][0], "ReadWriteOnce");

        let bad = [vol("data", VolumeKind::Persistent { id: String::new(), size_bytes: 1 })];
        assert!(matches!(materialize(false, &bad), Err(FerryError::BadInput(_))));
    }

    #[test]
    fn configurable_volume_is_content_addressed() {
        let entries = |contents: &str| {
            vec![vol("cfg", VolumeKind::Configurable {
                entries: vec![ConfigurableEntry { path: "app.yaml".into(), source: EntrySource::Inline(FileContents { path: String::new(), contents: contents.into() }) }],
            })]
        };
        let a = materialize(false, &entries("x: 1")).unwrap();
        let b = materialize(false, &entries("x: 1")).unwrap();
        let c = materialize(false, &entries("x: 2")).unwrap();
        let name = |p: &PodVolumes| p.ops[0].resource().unwrap()["metadata"]["name"].as_str().unwrap().to_string();
        assert_eq!(name(&a), name(&b));
        assert_ne!(name(&a), name(&c));
        assert!(name(&a).starts_with("ferry-static-"));
        assert_eq!(name(&a).len(), "ferry-static-".len() + 20);
        let cm = a.ops[0].resource().unwrap();
        assert_eq!(cm["immutable"], true);
        assert_eq!(cm["metadata"]["labels"][LABEL_KIND], KIND_STATIC_CONFIG);
        assert_eq!(a.volumes[0]["projected"]["sources"][0]["configMap"]["items"][0]["path"], "app.yaml");
    }

    #[test]
    fn mounts_skip_workspace_sync_and_reject_unknown() {
        let vols = [vol("scratch", VolumeKind::Ephemeral), vol("src", VolumeKind::WorkspaceSync { path: "/src".into() })];
        let pv = materialize(false, &vols).unwrap();
        assert_eq!(pv.volumes.len(), 1);
        let mounts = [
            Mount { path: "/tmp".into(), volume: Some("scratch".into()), readonly: false },
            Mount { path: "/src".into(), volume: Some("src".into()), readonly: true },
        ];
        let out = pv.mounts(&mounts).unwrap();
        assert_eq!(out, vec![json!({"name": "v-scratch", "mountPath": "/tmp", "readOnly": false})]);
        let unknown = [Mount { path: "/x".into(), volume: Some("nope".into()), readonly: false }];
        assert!(matches!(pv.mounts(&unknown), Err(FerryError::Internal(_))));
    }

    #[test]
    fn quantities_use_binary_units() {
        assert_eq!(quantity(1024), "1Ki");
        assert_eq!(quantity(3 << 20), "3Mi");
        assert_eq!(quantity(1000), "1000");
    }
}
