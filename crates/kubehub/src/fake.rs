//! In-memory cluster for tests: server-side apply as a JSON merge, generation
//! bumps on spec changes, label-selector lists and a stale REST mapping switch.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{FerryError, Gvk, Result};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{object_name, ClusterApi, ResourceType, Target};

#[derive(Default)]
struct Inner {
    served: BTreeMap<Gvk, ResourceType>,
    stale: HashSet<Gvk>,
    objects: BTreeMap<String, Value>,
    resource_version: u64,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<Inner>,
    applies: AtomicUsize,
    resets: AtomicUsize,
}

fn key(gvk: &Gvk, ns: Option<&str>, name: &str) -> String { format!("{}|{}|{}", gvk.key(), ns.unwrap_or_default(), name) }

fn merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => merge(existing, v),
                    _ => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

fn without_server_fields(v: &Value) -> Value {
    let mut v = v.clone();
    if let Some(o) = v.as_object_mut() {
        o.remove("status");
        o.remove("metadata");
    }
    v
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => obj.pointer("/metadata/labels").and_then(|l| l.get(k.trim())).and_then(Value::as_str) == Some(v.trim()),
        None => obj.pointer("/metadata/labels").and_then(|l| l.get(term.trim())).is_some(),
    })
}

impl FakeCluster {
    /// Serves the core kinds the planner emits.
    pub fn new() -> Self {
        let fake = Self::default();
        for (g, v, k, plural, namespaced) in [
            ("", "v1", "Namespace", "namespaces", false),
            ("", "v1", "ConfigMap", "configmaps", true),
            ("", "v1", "Secret", "secrets", true),
            ("", "v1", "Service", "services", true),
            ("", "v1", "ServiceAccount", "serviceaccounts", true),
            ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
            ("", "v1", "Pod", "pods", true),
            ("apps", "v1", "Deployment", "deployments", true),
            ("apps", "v1", "StatefulSet", "statefulsets", true),
            ("apps", "v1", "DaemonSet", "daemonsets", true),
            ("apps", "v1", "ReplicaSet", "replicasets", true),
            ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false),
            ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
        ] {
            fake.serve(ResourceType::new(Gvk::new(g, v, k), plural, namespaced));
        }
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn serve(&self, rt: ResourceType) { self.lock().served.insert(rt.gvk.clone(), rt); }

    /// Make `resolve` fail for `gvk` until the mapping is reset.
    pub fn mark_stale(&self, gvk: &Gvk) { self.lock().stale.insert(gvk.clone()); }

    pub fn apply_count(&self) -> usize { self.applies.load(Ordering::SeqCst) }

    pub fn reset_count(&self) -> usize { self.resets.load(Ordering::SeqCst) }

    pub fn object(&self, gvk: &Gvk, ns: Option<&str>, name: &str) -> Option<Value> { self.lock().objects.get(&key(gvk, ns, name)).cloned() }

    /// Insert or replace an object as a controller would, bypassing apply.
    pub fn put(&self, obj: Value) -> Result<()> {
        let gvk = Gvk::of(&obj)?;
        let name = object_name(&obj)?;
        let ns = obj.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string);
        let mut inner = self.lock();
        inner.resource_version += 1;
        let mut obj = obj;
        merge(&mut obj, &json!({"metadata": {"resourceVersion": inner.resource_version.to_string()}}));
        inner.objects.insert(key(&gvk, ns.as_deref(), &name), obj);
        Ok(())
    }

    /// Overwrite `status` of an existing object.
    pub fn set_status(&self, gvk: &Gvk, ns: Option<&str>, name: &str, status: Value) -> Result<()> {
        let mut inner = self.lock();
        let obj = inner.objects.get_mut(&key(gvk, ns, name)).ok_or_else(|| FerryError::NotFound(name.to_string()))?;
        if let Some(o) = obj.as_object_mut() {
            o.insert("status".into(), status);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn resolve(&self, gvk: &Gvk) -> Result<ResourceType> {
        let inner = self.lock();
        let no_match = || FerryError::NoMatch { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() };
        if inner.stale.contains(gvk) {
            return Err(no_match());
        }
        inner.served.get(gvk).cloned().ok_or_else(no_match)
    }

    fn reset_mapping(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.lock().stale.clear();
    }

    async fn apply(&self, target: &Target, name: &str, obj: &Value, _field_manager: &str) -> Result<Value> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let gvk = &target.resource.gvk;
        let k = key(gvk, target.namespace.as_deref(), name);
        let mut inner = self.lock();
        inner.resource_version += 1;
        let rv = inner.resource_version;
        let merged = match inner.objects.get(&k) {
            Some(live) => {
                let mut next = live.clone();
                merge(&mut next, obj);
                if without_server_fields(&next) != without_server_fields(live) {
                    let gen = live.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1) + 1;
                    merge(&mut next, &json!({"metadata": {"generation": gen, "resourceVersion": rv.to_string()}}));
                }
                next
            }
            None => {
                let mut next = obj.clone();
                let mut meta = Map::new();
                meta.insert("name".into(), json!(name));
                if let Some(ns) = &target.namespace {
                    meta.insert("namespace".into(), json!(ns));
                }
                meta.insert("uid".into(), json!(format!("00000000-0000-0000-0000-{:012}", rv)));
                meta.insert("generation".into(), json!(1));
                meta.insert("resourceVersion".into(), json!(rv.to_string()));
                merge(&mut next, &json!({ "metadata": Value::Object(meta) }));
                next
            }
        };
        inner.objects.insert(k, merged.clone());
        Ok(merged)
    }

    async fn get(&self, target: &Target, name: &str) -> Result<Option<Value>> {
        Ok(self.lock().objects.get(&key(&target.resource.gvk, target.namespace.as_deref(), name)).cloned())
    }

    async fn list(&self, target: &Target, label_selector: &str) -> Result<Vec<Value>> {
        let prefix = match &target.namespace {
            Some(ns) => format!("{}|{}|", target.resource.gvk.key(), ns),
            None => format!("{}|", target.resource.gvk.key()),
        };
        Ok(self.lock().objects.iter().filter(|(k, v)| k.starts_with(&prefix) && labels_match(v, label_selector)).map(|(_, v)| v.clone()).collect())
    }

    async fn create(&self, target: &Target, obj: &Value) -> Result<Value> {
        let name = object_name(obj)?;
        if self.get(target, &name).await?.is_some() {
            return Err(FerryError::AlreadyExists(target.describe(&name)));
        }
        self.apply(target, &name, obj, "create").await
    }

    async fn delete(&self, target: &Target, name: &str) -> Result<()> {
        let k = key(&target.resource.gvk, target.namespace.as_deref(), name);
        match self.lock().objects.remove(&k) {
            Some(_) => Ok(()),
            None => Err(FerryError::NotFound(target.describe(name))),
        }
    }

    async fn wait_until_exists(&self, target: &Target, name: &str, cancel: CancellationToken) -> Result<()> {
        loop {
            if self.get(target, name).await?.is_some() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}
