//! Container environment: values known at plan time go straight into the pod
//! template, the rest become instructions for the ensure-deployment handler.

use ferry_core::{EnvSource, EnvVar, Result, SetContainerField, SetValue, SetValueSource};
use serde_json::{json, Value};

use crate::secrets::SecretCollector;

pub fn fill_env(
    env: &[EnvVar],
    container_name: &str,
    secrets: &mut SecretCollector<'_>,
    deferred: &mut SetContainerField,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(env.len());
    for var in env {
        let late = |value: SetValueSource| SetValue { container_name: Some(container_name.to_string()), key: var.name.clone(), value };
        match &var.source {
            EnvSource::Literal(v) => out.push(json!({"name": var.name, "value": v})),
            EnvSource::Secret(name) => {
                let alloc = secrets.allocate(name)?;
                out.push(secret_key_ref(&var.name, &alloc.name, &alloc.key));
            }
            EnvSource::KubernetesSecret { name, key } => out.push(secret_key_ref(&var.name, name, key)),
            EnvSource::FieldRef(path) => out.push(json!({"name": var.name, "valueFrom": {"fieldRef": {"fieldPath": path}}})),
            EnvSource::ServiceEndpoint(r) => deferred.set_env.push(late(SetValueSource::ServiceEndpoint(r.clone()))),
            EnvSource::ServiceIngress(r) => deferred.set_env.push(late(SetValueSource::ServiceIngressBaseUrl(r.clone()))),
            EnvSource::ResourceField(sel) => deferred.set_env.push(late(SetValueSource::ResourceField(sel.clone()))),
            EnvSource::RuntimeConfig => deferred.set_env.push(late(SetValueSource::RuntimeConfig)),
            EnvSource::ResourceConfig => deferred.set_env.push(late(SetValueSource::ResourceConfig)),
        }
    }
    Ok(out)
}

fn secret_key_ref(var: &str, secret: &str, key: &str) -> Value {
    json!({"name": var, "valueFrom": {"secretKeyRef": {"name": secret, "key": key}}})
}
