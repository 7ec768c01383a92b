//! Ferry kubehub: the cluster seam, discovery-backed REST mapping and attached state.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use ferry_core::{FerryError, Gvk, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod attached;
#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use attached::{state_key, AttachedState};

pub const DISCOVERY_KEY: &str = "kubernetes.discovery";
pub const REST_MAPPER_KEY: &str = "kubernetes.restmapper";

/// A served resource type: what discovery knows about a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceType {
    pub gvk: Gvk,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceType {
    pub fn new(gvk: Gvk, plural: &str, namespaced: bool) -> Self { Self { gvk, plural: plural.to_string(), namespaced } }

    fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.gvk.group.clone(),
            version: self.gvk.version.clone(),
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Where a call lands: a resource type, optionally scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub resource: ResourceType,
    pub namespace: Option<String>,
}

impl Target {
    pub fn new(resource: ResourceType, namespace: &str) -> Self {
        let namespace = (resource.namespaced && !namespace.is_empty()).then(|| namespace.to_string());
        Self { resource, namespace }
    }

    pub fn describe(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.resource.gvk.kind, ns, name),
            None => format!("{} {}", self.resource.gvk.kind, name),
        }
    }
}

/// Kind -> served resource type, built once per connection from discovery.
#[derive(Debug, Clone, Default)]
pub struct RestMapper {
    by_gvk: HashMap<Gvk, ResourceType>,
}

impl RestMapper {
    pub fn from_resources(resources: impl IntoIterator<Item = ResourceType>) -> Self {
        Self { by_gvk: resources.into_iter().map(|r| (r.gvk.clone(), r)).collect() }
    }

    pub fn from_discovery(discovery: &Discovery) -> Self {
        let mut out = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    out.push(ResourceType::new(Gvk::new(&ar.group, &ar.version, &ar.kind), &ar.plural, namespaced));
                }
            }
        }
        Self::from_resources(out)
    }

    pub fn lookup(&self, gvk: &Gvk) -> Result<ResourceType> {
        self.by_gvk.get(gvk).cloned().ok_or_else(|| FerryError::NoMatch {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
        })
    }

    pub fn len(&self) -> usize { self.by_gvk.len() }

    pub fn is_empty(&self) -> bool { self.by_gvk.is_empty() }
}

/// Everything the planner's executor and waiters need from a cluster.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Map a kind to a served resource type. `NoMatch` when the cluster does not serve it.
    async fn resolve(&self, gvk: &Gvk) -> Result<ResourceType>;
    /// Forget cached REST mappings so the next `resolve` re-reads discovery.
    fn reset_mapping(&self);
    /// Server-side apply, forcing ownership for `field_manager`.
    async fn apply(&self, target: &Target, name: &str, obj: &Value, field_manager: &str) -> Result<Value>;
    /// `None` when the object does not exist.
    async fn get(&self, target: &Target, name: &str) -> Result<Option<Value>>;
    async fn list(&self, target: &Target, label_selector: &str) -> Result<Vec<Value>>;
    /// `AlreadyExists` when the object is present.
    async fn create(&self, target: &Target, obj: &Value) -> Result<Value>;
    /// `NotFound` when the object is absent.
    async fn delete(&self, target: &Target, name: &str) -> Result<()>;
    /// Block on a watch until the named object is observed.
    async fn wait_until_exists(&self, target: &Target, name: &str, cancel: CancellationToken) -> Result<()>;
}

pub type SharedCluster = Arc<dyn ClusterApi>;

/// Build a client from the ambient kube config (in-cluster or current context).
pub async fn get_kube_client() -> anyhow::Result<Client> {
    static CLIENT: tokio::sync::OnceCell<Client> = tokio::sync::OnceCell::const_new();
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client from the current context") })
        .await?;
    Ok(client.clone())
}

fn invocation(what: String, e: kube::Error) -> FerryError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => FerryError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => FerryError::AlreadyExists(what),
        _ => FerryError::invocation(what, e),
    }
}

fn object_name(obj: &Value) -> Result<String> {
    obj.pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| FerryError::bad_input("object is missing metadata.name"))
}

fn to_value(obj: DynamicObject) -> Result<Value> { Ok(serde_json::to_value(obj)?) }

/// [`ClusterApi`] over a live kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    state: Arc<AttachedState>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client, state: Arc::new(AttachedState::new()) } }

    pub async fn connect() -> anyhow::Result<Self> {
        let client = get_kube_client().await?;
        let ver = client.apiserver_version().await.context("reaching the API server")?;
        info!(server = %ver.git_version, "connected to cluster");
        Ok(Self::new(client))
    }

    async fn discovery(&self) -> Result<Arc<Discovery>> {
        let client = self.client.clone();
        self.state
            .get_or_resolve(DISCOVERY_KEY, || async move {
                Discovery::new(client).run().await.map_err(|e| FerryError::invocation("running discovery", e))
            })
            .await
    }

    async fn rest_mapper(&self) -> Result<Arc<RestMapper>> {
        self.state
            .get_or_resolve(REST_MAPPER_KEY, || async {
                let discovery = self.discovery().await?;
                let mapper = RestMapper::from_discovery(&discovery);
                debug!(kinds = mapper.len(), "rest mapper built");
                Ok(mapper)
            })
            .await
    }

    fn api(&self, target: &Target) -> Result<Api<DynamicObject>> {
        let ar = target.resource.api_resource();
        match (&target.namespace, target.resource.namespaced) {
            (Some(ns), true) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            (None, _) | (Some(_), false) => Ok(Api::all_with(self.client.clone(), &ar)),
        }
    }

    fn scoped_api(&self, target: &Target, name: &str) -> Result<Api<DynamicObject>> {
        if target.resource.namespaced && target.namespace.is_none() {
            return Err(FerryError::bad_input(format!("{}: namespace required for namespaced kind", target.describe(name))));
        }
        self.api(target)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn resolve(&self, gvk: &Gvk) -> Result<ResourceType> { self.rest_mapper().await?.lookup(gvk) }

    fn reset_mapping(&self) {
        self.state.reset(REST_MAPPER_KEY);
        self.state.reset(DISCOVERY_KEY);
    }

    async fn apply(&self, target: &Target, name: &str, obj: &Value, field_manager: &str) -> Result<Value> {
        let api = self.scoped_api(target, name)?;
        let pp = PatchParams::apply(field_manager).force();
        let out = api.patch(name, &pp, &Patch::Apply(obj)).await.map_err(|e| invocation(format!("apply {}", target.describe(name)), e))?;
        to_value(out)
    }

    async fn get(&self, target: &Target, name: &str) -> Result<Option<Value>> {
        let api = self.scoped_api(target, name)?;
        match api.get_opt(name).await.map_err(|e| invocation(format!("get {}", target.describe(name)), e))? {
            Some(o) => Ok(Some(to_value(o)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, target: &Target, label_selector: &str) -> Result<Vec<Value>> {
        let api = self.api(target)?;
        let mut lp = ListParams::default();
        if !label_selector.is_empty() {
            lp = lp.labels(label_selector);
        }
        let list = api.list(&lp).await.map_err(|e| invocation(format!("list {}", target.resource.gvk), e))?;
        list.items.into_iter().map(to_value).collect()
    }

    async fn create(&self, target: &Target, obj: &Value) -> Result<Value> {
        let name = object_name(obj)?;
        let api = self.scoped_api(target, &name)?;
        let dynobj: DynamicObject = serde_json::from_value(obj.clone())?;
        let out = api.create(&PostParams::default(), &dynobj).await.map_err(|e| invocation(format!("create {}", target.describe(&name)), e))?;
        to_value(out)
    }

    async fn delete(&self, target: &Target, name: &str) -> Result<()> {
        let api = self.scoped_api(target, name)?;
        api.delete(name, &DeleteParams::default()).await.map_err(|e| invocation(format!("delete {}", target.describe(name)), e))?;
        Ok(())
    }

    async fn wait_until_exists(&self, target: &Target, name: &str, cancel: CancellationToken) -> Result<()> {
        let api = self.scoped_api(target, name)?;
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let stream = watcher::watcher(api, cfg);
        futures::pin_mut!(stream);
        let seen = |o: &DynamicObject| o.metadata.name.as_deref() == Some(name);
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                ev = stream.try_next() => ev.map_err(|e| FerryError::invocation(format!("watch {}", target.describe(name)), e))?,
            };
            match ev {
                Some(Event::Applied(o)) if seen(&o) => return Ok(()),
                Some(Event::Restarted(list)) if list.iter().any(seen) => return Ok(()),
                Some(_) => {}
                None => return Err(FerryError::internal(format!("watch on {} ended", target.describe(name)))),
            }
        }
    }
}
