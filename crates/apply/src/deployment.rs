use async_trait::async_trait;
use ferry_core::runtime::{parse_resource_data, select_field, RuntimeServices};
use ferry_core::{
    naming, prepare_event, runtime_config_output, EnsureRuntimeConfigOutput, FerryError, Gvk, OpEnsureDeployment, OpSpec, Operation, PlanOrderRules, Result, ScheduleOrder,
    SetContainerField, SetValue, SetValueSource, Stage, WorkloadKind,
};
use serde_json::{json, Value};

use crate::apply::{apply_object, object_order, ApplyRequest};
use crate::{ExecContext, Handler, HandlerResult, Inputs};

fn workload_kind(obj: &Value) -> Result<WorkloadKind> {
    let gvk = Gvk::of(obj)?;
    WorkloadKind::from_gvk(&gvk).ok_or_else(|| FerryError::internal(format!("{}: not a workload kind", gvk)))
}

fn object_mut<'v>(v: &'v mut Value, what: &str) -> Result<&'v mut serde_json::Map<String, Value>> {
    if v.is_null() {
        *v = json!({});
    }
    v.as_object_mut().ok_or_else(|| FerryError::internal(format!("{} is not an object", what)))
}

fn array_mut<'v>(parent: &'v mut serde_json::Map<String, Value>, key: &str) -> Result<&'v mut Vec<Value>> {
    parent.entry(key).or_insert_with(|| json!([])).as_array_mut().ok_or_else(|| FerryError::internal(format!("{} is not a list", key)))
}

fn pod_spec_mut(obj: &mut Value, kind: WorkloadKind) -> Result<&mut serde_json::Map<String, Value>> {
    let p = kind.pod_spec_pointer();
    let spec = obj.pointer_mut(p).ok_or_else(|| FerryError::internal(format!("{} is missing", p)))?;
    object_mut(spec, p)
}

/// Annotate the workload with the config it consumes and mount the config map.
fn wire_runtime_config(obj: &mut Value, kind: WorkloadKind, volume_name: Option<&str>, config_id: &str) -> Result<()> {
    if config_id.is_empty() {
        return Ok(());
    }
    let meta = object_mut(obj.as_object_mut().ok_or_else(|| FerryError::internal("workload is not an object"))?.entry("metadata").or_insert_with(|| json!({})), "metadata")?;
    object_mut(meta.entry("annotations").or_insert(Value::Null), "metadata.annotations")?.insert(naming::ANN_RUNTIME_CONFIG.into(), json!(config_id));
    if let Some(name) = volume_name {
        array_mut(pod_spec_mut(obj, kind)?, "volumes")?.push(json!({"name": name, "configMap": {"name": config_id}}));
    }
    Ok(())
}

fn resource_field_value(v: Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err(FerryError::bad_input(format!("unsupported resource field value: {}", ferry_core::runtime::json_type(&other)))),
    }
}

fn resolve_value(src: &SetValueSource, out: &EnsureRuntimeConfigOutput) -> Result<String> {
    match src {
        SetValueSource::RuntimeConfig => Ok(out.serialized_runtime_json.clone()),
        SetValueSource::ResourceConfig => Ok(out.serialized_resource_json.clone()),
        SetValueSource::ServiceEndpoint(r) => RuntimeServices::parse(&out.serialized_runtime_json)?.endpoint(r),
        SetValueSource::ServiceIngressBaseUrl(r) => RuntimeServices::parse(&out.serialized_runtime_json)?.ingress_base_url(r),
        SetValueSource::ResourceField(sel) => {
            let data = parse_resource_data(&out.serialized_resource_json)?;
            let v = select_field(&data, sel).map_err(|e| FerryError::internal(format!("failed to select resource value: {}", e)))?;
            resource_field_value(v)
        }
    }
}

/// Run `f` on every container matching `name` (all of them when unset).
fn update_containers(obj: &mut Value, kind: WorkloadKind, name: Option<&str>, mut f: impl FnMut(&mut serde_json::Map<String, Value>) -> Result<()>) -> Result<()> {
    let name = name.filter(|n| !n.is_empty());
    let mut matched = false;
    for c in array_mut(pod_spec_mut(obj, kind)?, "containers")? {
        let c = c.as_object_mut().ok_or_else(|| FerryError::internal("container is not an object"))?;
        if name.is_some_and(|n| c.get("name").and_then(Value::as_str) != Some(n)) {
            continue;
        }
        matched = true;
        f(c)?;
    }
    if matched { Ok(()) } else { Err(FerryError::bad_input(format!("no container matched name {:?}", name.unwrap_or_default()))) }
}

/// Apply one `SetContainerField` to the workload's containers.
pub fn set_container_field(obj: &mut Value, kind: WorkloadKind, field: &SetContainerField, out: &EnsureRuntimeConfigOutput) -> Result<()> {
    let set = |obj: &mut Value, sv: &SetValue, env: bool| -> Result<()> {
        let value = resolve_value(&sv.value, out)?;
        update_containers(obj, kind, sv.container_name.as_deref(), |c| {
            if env {
                array_mut(c, "env")?.push(json!({"name": sv.key, "value": value}));
            } else {
                array_mut(c, "args")?.push(json!(format!("{}={}", sv.key, value)));
            }
            Ok(())
        })
    };
    for sv in &field.set_arg {
        set(obj, sv, false)?;
    }
    for sv in &field.set_env {
        set(obj, sv, true)?;
    }
    Ok(())
}

pub struct EnsureDeploymentHandler;

#[async_trait]
impl Handler for EnsureDeploymentHandler {
    fn kind(&self) -> &'static str { OpEnsureDeployment::KIND }

    fn plan_order(&self, op: &Operation, rules: &PlanOrderRules) -> Result<ScheduleOrder> {
        let spec: OpEnsureDeployment = op.decode()?;
        object_order(spec.resource.as_ref().ok_or_else(|| FerryError::internal("ensureDeployment.Resource is required"))?, rules)
    }

    async fn handle(&self, ctx: &ExecContext, op: &Operation, inputs: &Inputs) -> Result<HandlerResult> {
        let spec: OpEnsureDeployment = op.decode()?;
        let mut obj = spec.resource.clone().ok_or_else(|| FerryError::internal("ensureDeployment.Resource is required"))?;
        if !spec.inhibit_events {
            let gvk = Gvk::of(&obj)?;
            let name = obj.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();
            let ns = obj.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or_default();
            let mut ev = prepare_event(&gvk, ns, name, &op.description, Some(&spec.deployable));
            ev.stage = Stage::Waiting;
            ctx.emit(ev).await;
        }
        if spec.needs_runtime_config() {
            let key = runtime_config_output(&spec.deployable);
            let raw = inputs.get(&key).ok_or_else(|| FerryError::internal(format!("{}: input missing", key)))?;
            let out: EnsureRuntimeConfigOutput = serde_json::from_value(raw.clone())?;
            let kind = workload_kind(&obj)?;
            wire_runtime_config(&mut obj, kind, spec.configuration_volume_name.as_deref(), &out.config_id)?;
            for field in &spec.set_container_fields {
                set_container_field(&mut obj, kind, field, &out).map_err(|e| e.context(&op.description))?;
            }
        }
        let req = ApplyRequest { inhibit_events: spec.inhibit_events, deployable: Some(&spec.deployable), ..ApplyRequest::new(&op.description, &obj) };
        Ok(HandlerResult::waiting(apply_object(ctx, req).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{FieldSelector, ServiceRef};

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "shop"},
            "spec": {"template": {"spec": {"containers": [{"name": "main", "image": "a"}, {"name": "proxy", "image": "p"}]}}}
        })
    }

    fn output() -> EnsureRuntimeConfigOutput {
        EnsureRuntimeConfigOutput {
            config_id: "api-abc-01234567-runtimecfg".into(),
            serialized_runtime_json: json!({"stack_entry": [{"server": {"package_name": "acme/db"}, "service": [{"name": "grpc", "endpoint": "db:5000", "ingress": [{"base_url": "https://db.example"}]}]}]}).to_string(),
            serialized_resource_json: json!({"cache": {"port": 6379, "host": "redis", "tls": true}}).to_string(),
        }
    }

    fn sv(container: Option<&str>, key: &str, value: SetValueSource) -> SetValue { SetValue { container_name: container.map(str::to_string), key: key.into(), value } }

    #[test]
    fn runtime_config_is_annotated_and_mounted() {
        let mut obj = deployment();
        wire_runtime_config(&mut obj, WorkloadKind::Deployment, Some("ferry-rtconfig"), "cfg-1").unwrap();
        assert_eq!(obj["metadata"]["annotations"][naming::ANN_RUNTIME_CONFIG], "cfg-1");
        assert_eq!(obj["spec"]["template"]["spec"]["volumes"][0]["configMap"]["name"], "cfg-1");
        let mut untouched = deployment();
        wire_runtime_config(&mut untouched, WorkloadKind::Deployment, Some("ferry-rtconfig"), "").unwrap();
        assert_eq!(untouched, deployment());
    }

    #[test]
    fn args_and_env_are_set_on_matching_containers() {
        let mut obj = deployment();
        let field = SetContainerField {
            set_arg: vec![sv(Some("main"), "--db", SetValueSource::ServiceEndpoint(ServiceRef { server: "acme/db".into(), service_name: "grpc".into() }))],
            set_env: vec![sv(None, "CACHE_PORT", SetValueSource::ResourceField(FieldSelector { resource: "cache".into(), field_selector: "port".into() }))],
        };
        set_container_field(&mut obj, WorkloadKind::Deployment, &field, &output()).unwrap();
        let cs = &obj["spec"]["template"]["spec"]["containers"];
        assert_eq!(cs[0]["args"][0], "--db=db:5000");
        assert!(cs[1].get("args").is_none());
        assert_eq!(cs[0]["env"][0]["value"], "6379");
        assert_eq!(cs[1]["env"][0]["name"], "CACHE_PORT");
    }

    #[test]
    fn unmatched_container_and_odd_values_are_bad_input() {
        let mut obj = deployment();
        let missing = SetContainerField { set_env: vec![sv(Some("nope"), "X", SetValueSource::RuntimeConfig)], ..Default::default() };
        assert!(matches!(set_container_field(&mut obj, WorkloadKind::Deployment, &missing, &output()), Err(FerryError::BadInput(_))));
        let boolean = SetContainerField {
            set_env: vec![sv(None, "TLS", SetValueSource::ResourceField(FieldSelector { resource: "cache".into(), field_selector: "tls".into() }))],
            ..Default::default()
        };
        assert!(matches!(set_container_field(&mut obj, WorkloadKind::Deployment, &boolean, &output()), Err(FerryError::BadInput(_))));
        let absent = SetContainerField {
            set_env: vec![sv(None, "X", SetValueSource::ResourceField(FieldSelector { resource: "cache".into(), field_selector: "user".into() }))],
            ..Default::default()
        };
        assert!(matches!(set_container_field(&mut obj, WorkloadKind::Deployment, &absent, &output()), Err(FerryError::Internal(_))));
    }
}
