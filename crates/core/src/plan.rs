//! Operations, typed operation payloads and the plan that carries them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deployable::{DeployableRef, ResourceDependency, SetContainerField};
use crate::sched::ScheduleOrder;
use crate::{FerryError, Result};

/// A typed operation payload, tagged by `KIND` when carried in an [`Operation`].
pub trait OpSpec: Serialize + DeserializeOwned {
    const KIND: &'static str;
}

/// One idempotent unit of cluster work. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub description: String,
    pub kind: String,
    pub body: Value,
    #[serde(default)]
    pub scope: Vec<String>,
    /// Explicit order, merged with whatever the handler computes from the body.
    #[serde(default)]
    pub order: Option<ScheduleOrder>,
    #[serde(default)]
    pub minimum_version: u32,
    /// Output keys of other operations this one consumes.
    #[serde(default)]
    pub required_outputs: Vec<String>,
}

impl Operation {
    pub fn new<T: OpSpec>(description: impl Into<String>, spec: &T) -> Result<Self> {
        Ok(Self {
            description: description.into(),
            kind: T::KIND.to_string(),
            body: serde_json::to_value(spec)?,
            scope: Vec::new(),
            order: None,
            minimum_version: 0,
            required_outputs: Vec::new(),
        })
    }

    pub fn with_scope(mut self, package: &str) -> Self {
        if !package.is_empty() && !self.scope.iter().any(|s| s == package) {
            self.scope.push(package.to_string());
        }
        self
    }

    pub fn with_order(mut self, order: ScheduleOrder) -> Self {
        match self.order.as_mut() {
            Some(o) => o.merge(&order),
            None => self.order = Some(order),
        }
        self
    }

    pub fn with_minimum_version(mut self, v: u32) -> Self { self.minimum_version = v; self }

    pub fn requires(mut self, output: impl Into<String>) -> Self { self.required_outputs.push(output.into()); self }

    /// Decode the payload; a kind mismatch or a malformed body is a defect.
    pub fn decode<T: OpSpec>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(FerryError::internal(format!("expected a {} operation, got {}", T::KIND, self.kind)));
        }
        serde_json::from_value(self.body.clone()).map_err(|e| FerryError::internal(format!("{}: failed to decode: {}", self.kind, e)))
    }

    /// The cluster object carried by resource-bearing payloads, if any.
    pub fn resource(&self) -> Option<&Value> { self.body.get("resource").filter(|v| !v.is_null()) }
}

/// Operations plus hints, created fresh per planning call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentPlan {
    pub operations: Vec<Operation>,
    pub hints: Vec<String>,
    pub namespace_reference: String,
}

impl DeploymentPlan {
    pub fn extend(&mut self, other: DeploymentPlan) {
        self.operations.extend(other.operations);
        self.hints.extend(other.hints);
        if self.namespace_reference.is_empty() {
            self.namespace_reference = other.namespace_reference;
        }
    }

    /// Every object the plan would send to the cluster, as multi-document YAML.
    pub fn declarations_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for r in self.operations.iter().filter_map(Operation::resource) {
            let doc = serde_yaml::to_string(r).map_err(|e| FerryError::internal(format!("rendering declarations: {}", e)))?;
            out.push_str("---\n");
            out.push_str(&doc);
        }
        Ok(out)
    }
}

/// Wait until `metadata.generation` is observed together with a `True` condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationCondition {
    pub condition_type: String,
}

/// Server-side apply of one object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpApply {
    pub resource: Option<Value>,
    pub inhibit_events: bool,
    pub check_generation_condition: Option<GenerationCondition>,
    pub deployable: Option<DeployableRef>,
}

impl OpSpec for OpApply {
    const KIND: &'static str = "ferry.kubernetes.apply";
}

/// Apply a workload, first wiring in the runtime config and any container fields
/// that can only be computed once the runtime config exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpEnsureDeployment {
    pub deployable: DeployableRef,
    pub resource: Option<Value>,
    pub configuration_volume_name: Option<String>,
    pub set_container_fields: Vec<SetContainerField>,
    pub inhibit_events: bool,
    /// The workload waits on the runtime config op even when nothing is mounted.
    pub runtime_config_dependency: bool,
}

impl OpSpec for OpEnsureDeployment {
    const KIND: &'static str = "ferry.kubernetes.ensure-deployment";
}

impl OpEnsureDeployment {
    pub fn needs_runtime_config(&self) -> bool {
        self.runtime_config_dependency || self.configuration_volume_name.is_some() || !self.set_container_fields.is_empty()
    }
}

/// Resource data provided by the system rather than declared by the deployable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectedResource {
    pub resource_ref: String,
    pub instance: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpEnsureRuntimeConfig {
    pub deployable: DeployableRef,
    pub namespace: String,
    pub runtime_config: Option<Value>,
    pub resource_deps: Vec<ResourceDependency>,
    pub injected_resources: Vec<InjectedResource>,
    pub build_vcs: Option<Value>,
    pub persist_configuration: bool,
}

impl OpSpec for OpEnsureRuntimeConfig {
    const KIND: &'static str = "ferry.kubernetes.ensure-runtime-config";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsureRuntimeConfigOutput {
    pub config_id: String,
    pub serialized_runtime_json: String,
    pub serialized_resource_json: String,
}

/// Create-if-absent. Used for generated secrets so re-runs keep their values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpCreate {
    pub resource: Option<Value>,
    pub skip_if_already_exists: bool,
}

impl OpSpec for OpCreate {
    const KIND: &'static str = "ferry.kubernetes.create";
}

/// Delete runtime-config ConfigMaps no workload references anymore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpCleanupRuntimeConfig {
    pub namespace: String,
    pub check_pods: bool,
}

impl OpSpec for OpCleanupRuntimeConfig {
    const KIND: &'static str = "ferry.kubernetes.cleanup-runtime-config";
}

/// Output key under which the runtime config op publishes its result.
pub fn runtime_config_output(d: &DeployableRef) -> String { format!("runtime-config:{}", d.id) }
