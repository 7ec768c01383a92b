//! Workload descriptor consumed by the planner. Owned by the caller, read-only here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    #[default]
    Development,
    Testing,
    Production,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub name: String,
    pub purpose: Purpose,
    pub ephemeral: bool,
}

/// Where a plan lands: one namespace in one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentTarget {
    pub namespace: String,
    pub env: Environment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployableClass {
    #[default]
    Stateless,
    Stateful,
    Daemonset,
    OneShot,
    Manual,
}

impl DeployableClass {
    pub fn is_one_shot_like(self) -> bool { matches!(self, Self::OneShot | Self::Manual) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn is_resolved(&self) -> bool { !self.repository.is_empty() }

    /// `repo@digest`, falling back to `repo:tag`.
    pub fn image(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => format!("{}@{}", self.repository, d),
            (None, Some(t)) => format!("{}:{}", self.repository, t),
            (None, None) => self.repository.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunAs {
    pub user_id: Option<String>,
    pub fs_group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: i32,
}

/// Reference to a service exported by some server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRef {
    pub server: String,
    pub service_name: String,
}

/// A dotted path into a resource instance, e.g. `address` or `credentials.user`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelector {
    pub resource: String,
    pub field_selector: String,
}

/// Where an environment value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvSource {
    Literal(String),
    /// A secret declared in [`Deployable::secrets`].
    Secret(String),
    KubernetesSecret { name: String, key: String },
    /// Downward API field path, e.g. `metadata.name`.
    FieldRef(String),
    ServiceEndpoint(ServiceRef),
    ServiceIngress(ServiceRef),
    ResourceField(FieldSelector),
    RuntimeConfig,
    ResourceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub source: EnvSource,
}

impl EnvVar {
    pub fn literal(name: &str, value: &str) -> Self { Self { name: name.to_string(), source: EnvSource::Literal(value.to_string()) } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    pub path: String,
    pub volume: Option<String>,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub working_dir: Option<String>,
    pub ports: Vec<ContainerPort>,
    pub run_as: Option<RunAs>,
    pub privileged: bool,
    pub read_only_filesystem: bool,
    pub mounts: Vec<Mount>,
    /// Init containers only: the key init-container extensions address.
    pub package_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileContents {
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Inline(FileContents),
    InlineSet(Vec<FileContents>),
    SecretRef(String),
    KubernetesSecret { name: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurableEntry {
    pub path: String,
    pub source: EntrySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeKind {
    Ephemeral,
    HostPath { directory: String },
    Persistent { id: String, size_bytes: u64 },
    WorkspaceSync { path: String },
    Configurable { entries: Vec<ConfigurableEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub kind: VolumeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretValue {
    Static(String),
    /// Generated once; later plans keep whatever already lives in the cluster.
    Generate { unique_key: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
    pub value: SecretValue,
}

/// A secret exposed to the server as a resource file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretResource {
    pub resource_ref: String,
    pub secret_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDependency {
    pub resource_ref: String,
    pub resource_class: String,
    pub instance: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannedDependency {
    pub resource_ref: String,
    pub resource_instance_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputedResource {
    pub resource_instance_id: String,
    pub instance_type: String,
    pub instance: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterRoleRef {
    pub label: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub cluster_roles: Vec<ClusterRoleRef>,
}

/// `kind` is `liveness` or `readiness`; anything else is rejected by the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Probe {
    pub kind: String,
    pub path: String,
    pub container_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub service_name: String,
    pub allocated_name: String,
    pub port: Option<ContainerPort>,
    pub exported_port: i32,
    pub load_balancer: bool,
    pub annotations: BTreeMap<String, String>,
    pub grpc_services: Vec<String>,
}

/// Opaque extension payload; decoded by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionPayload {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toleration {
    pub key: String,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub effect: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetValueSource {
    RuntimeConfig,
    ResourceConfig,
    ServiceEndpoint(ServiceRef),
    ServiceIngressBaseUrl(ServiceRef),
    ResourceField(FieldSelector),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetValue {
    #[serde(default)]
    pub container_name: Option<String>,
    pub key: String,
    pub value: SetValueSource,
}

/// Container fields filled in at execution time, once the runtime config exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetContainerField {
    pub set_arg: Vec<SetValue>,
    pub set_env: Vec<SetValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployable {
    pub name: String,
    pub id: String,
    pub package_name: String,
    pub description: Option<String>,
    pub class: DeployableClass,
    pub replicas: i32,
    /// Focused deployables still report events when deployed to the admin namespace.
    pub focused: bool,
    pub main_container: ContainerSpec,
    pub sidecars: Vec<ContainerSpec>,
    pub inits: Vec<ContainerSpec>,
    pub volumes: Vec<Volume>,
    /// `None` when no secrets source is wired for this deployable.
    pub secrets: Option<Vec<SecretSpec>>,
    pub secret_resources: Vec<SecretResource>,
    pub resource_deps: Vec<ResourceDependency>,
    pub planned_resource_deps: Vec<PlannedDependency>,
    pub computed_resources: Vec<ComputedResource>,
    pub permissions: Permissions,
    pub probes: Vec<Probe>,
    pub extensions: Vec<ExtensionPayload>,
    pub endpoints: Vec<Endpoint>,
    pub runtime_config: Option<serde_json::Value>,
    pub build_vcs: Option<serde_json::Value>,
    pub mount_runtime_config_path: Option<String>,
    pub set_container_fields: Vec<SetContainerField>,
    pub config_image: Option<ImageRef>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
}

/// The identity fields operations carry about the deployable they belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployableRef {
    pub name: String,
    pub id: String,
    pub package_name: String,
    pub class: DeployableClass,
}

impl From<&Deployable> for DeployableRef {
    fn from(d: &Deployable) -> Self {
        Self { name: d.name.clone(), id: d.id.clone(), package_name: d.package_name.clone(), class: d.class }
    }
}
