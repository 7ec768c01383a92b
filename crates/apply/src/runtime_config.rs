//! Content-addressed runtime configuration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ferry_core::naming::{self, deployment_id_of};
use ferry_core::{
    runtime_config_output, sched, EnsureRuntimeConfigOutput, OpEnsureRuntimeConfig, OpSpec, Operation, PlanOrderRules, Result, ScheduleOrder,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::apply::{apply_object, ApplyRequest};
use crate::{ExecContext, Handler, HandlerResult, Inputs};

pub const RUNTIME_JSON: &str = "runtime.json";
pub const RESOURCES_JSON: &str = "resources.json";
pub const BUILD_VCS_JSON: &str = "buildvcs.json";

const CONFIG_FORMAT_VERSION: u32 = 0;

/// `{deploymentId}-{digest[..8]}-runtimecfg`. The digest covers the format
/// version and the runtime/resource payloads only, never build provenance.
pub fn runtime_config_id(deployment_id: &str, runtime_json: Option<&str>, resources_json: Option<&str>) -> Result<String> {
    let mut input: BTreeMap<&str, Value> = BTreeMap::new();
    input.insert("version", json!(CONFIG_FORMAT_VERSION));
    if let Some(r) = runtime_json {
        input.insert(RUNTIME_JSON, json!(r));
    }
    if let Some(r) = resources_json {
        input.insert(RESOURCES_JSON, json!(r));
    }
    let bytes = serde_json::to_vec(&input)?;
    let digest = hex::encode(Sha256::digest(&bytes));
    Ok(naming::make_resource_name(&[deployment_id, &digest[..8], "runtimecfg"]))
}

/// Serialized payloads for one runtime config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfigData {
    pub runtime_json: Option<String>,
    pub resources_json: Option<String>,
    pub build_vcs_json: Option<String>,
}

impl RuntimeConfigData {
    pub fn from_op(spec: &OpEnsureRuntimeConfig) -> Result<Self> {
        let runtime_json = spec.runtime_config.as_ref().map(serde_json::to_string).transpose()?;
        let mut resources: BTreeMap<&str, &Value> = BTreeMap::new();
        for dep in &spec.resource_deps {
            resources.insert(&dep.resource_ref, &dep.instance);
        }
        for inj in &spec.injected_resources {
            resources.insert(&inj.resource_ref, &inj.instance);
        }
        let resources_json = (!resources.is_empty()).then(|| serde_json::to_string(&resources)).transpose()?;
        let build_vcs_json = spec.build_vcs.as_ref().map(serde_json::to_string).transpose()?;
        Ok(Self { runtime_json, resources_json, build_vcs_json })
    }

    /// Provenance alone is not content: it is left out of the identity too.
    pub fn is_empty(&self) -> bool { self.runtime_json.is_none() && self.resources_json.is_none() }

    fn data(&self) -> Map<String, Value> {
        [(RUNTIME_JSON, &self.runtime_json), (RESOURCES_JSON, &self.resources_json), (BUILD_VCS_JSON, &self.build_vcs_json)]
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), Value::String(v.clone()))))
            .collect()
    }
}

fn config_map(id: &str, namespace: &str, spec: &OpEnsureRuntimeConfig, data: Map<String, Value>) -> Value {
    let mut labels = naming::base_labels();
    labels.extend(naming::select_by_id(&spec.deployable));
    labels.insert(naming::LABEL_KIND.into(), naming::KIND_RUNTIME_CONFIG.into());
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": id, "namespace": namespace, "labels": labels, "annotations": naming::base_annotations()},
        "immutable": true,
        "data": data,
    })
}

pub struct EnsureRuntimeConfigHandler;

#[async_trait]
impl Handler for EnsureRuntimeConfigHandler {
    fn kind(&self) -> &'static str { OpEnsureRuntimeConfig::KIND }

    fn plan_order(&self, op: &Operation, _rules: &PlanOrderRules) -> Result<ScheduleOrder> {
        let spec: OpEnsureRuntimeConfig = op.decode()?;
        Ok(ScheduleOrder::default().belongs_to(runtime_config_output(&spec.deployable)).after(sched::namespace_category(&spec.namespace)))
    }

    async fn handle(&self, ctx: &ExecContext, op: &Operation, _inputs: &Inputs) -> Result<HandlerResult> {
        let spec: OpEnsureRuntimeConfig = op.decode()?;
        let data = RuntimeConfigData::from_op(&spec)?;
        let mut out = EnsureRuntimeConfigOutput {
            config_id: String::new(),
            serialized_runtime_json: data.runtime_json.clone().unwrap_or_default(),
            serialized_resource_json: data.resources_json.clone().unwrap_or_default(),
        };
        if !data.is_empty() && spec.persist_configuration {
            let id = runtime_config_id(&deployment_id_of(&spec.deployable), data.runtime_json.as_deref(), data.resources_json.as_deref())?;
            let cm = config_map(&id, &spec.namespace, &spec, data.data());
            apply_object(ctx, ApplyRequest { inhibit_events: true, ..ApplyRequest::new(&op.description, &cm) }).await?;
            debug!(config = %id, "runtime config stored");
            out.config_id = id;
        }
        Ok(HandlerResult { outputs: vec![(runtime_config_output(&spec.deployable), serde_json::to_value(&out)?)], waiter: None })
    }
}
