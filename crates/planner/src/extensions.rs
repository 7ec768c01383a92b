//! Extension payloads contributed by other packages to a deployable.

use std::collections::BTreeMap;

use ferry_core::{EnvVar, ExtensionPayload, FerryError, Probe, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodSecurityOverride {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub fs_group: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecExtension {
    /// Raw pod volumes, passed through as given.
    pub volumes: Vec<Value>,
    pub annotations: BTreeMap<String, String>,
    pub ensure_service_account: bool,
    pub service_account: Option<String>,
    pub service_account_annotations: BTreeMap<String, String>,
    pub security_context: Option<PodSecurityOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
    /// Also mounted into init containers.
    pub mount_on_init: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerExtension {
    pub volume_mounts: Vec<ExtensionMount>,
    pub env: Vec<EnvVar>,
    /// Replaces nothing; appended to the main container args.
    pub args: Vec<String>,
    pub probes: Vec<Probe>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitContainerExtension {
    pub package_ref: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extension {
    Spec(SpecExtension),
    Container(ContainerExtension),
    InitContainer(InitContainerExtension),
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, payload: &Value) -> Result<T> {
    let payload = if payload.is_null() { Value::Object(Default::default()) } else { payload.clone() };
    serde_json::from_value(payload).map_err(|e| FerryError::internal(format!("failed to unmarshal {}: {}", what, e)))
}

impl Extension {
    pub fn decode(p: &ExtensionPayload) -> Result<Self> {
        match p.kind.as_str() {
            "spec" => Ok(Self::Spec(decode("SpecExtension", &p.payload)?)),
            "container" => Ok(Self::Container(decode("ContainerExtension", &p.payload)?)),
            "init_container" => Ok(Self::InitContainer(decode("InitContainerExtension", &p.payload)?)),
            other => Err(FerryError::internal(format!("unused startup input: {}", other))),
        }
    }
}

/// Keep `current` if unset or equal to `next`; otherwise the two conflict.
pub fn consolidate<T: Clone + PartialEq + std::fmt::Debug>(current: &mut Option<T>, next: &T, what: &str) -> Result<()> {
    match current {
        Some(c) if c != next => Err(FerryError::bad_input(format!("incompatible {} defined, {:?} vs {:?}", what, c, next))),
        Some(_) => Ok(()),
        None => {
            *current = Some(next.clone());
            Ok(())
        }
    }
}

/// Merge `extra` into `base`; a name set twice to different sources is rejected.
pub fn merge_envs(base: &mut Vec<EnvVar>, extra: &[EnvVar]) -> Result<()> {
    for e in extra {
        match base.iter().find(|b| b.name == e.name) {
            Some(b) if b.source != e.source => {
                return Err(FerryError::bad_input(format!("incompatible values being set for env variable {:?} ({:?} vs {:?})", e.name, b.source, e.source)));
            }
            Some(_) => {}
            None => base.push(e.clone()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_by_kind() {
        let p = ExtensionPayload { kind: "spec".into(), payload: json!({"service_account": "api", "annotations": {"a": "b"}}) };
        match Extension::decode(&p).unwrap() {
            Extension::Spec(s) => assert_eq!(s.service_account.as_deref(), Some("api")),
            other => panic!("unexpected {other:?}"),
        }
        let bad = ExtensionPayload { kind: "container".into(), payload: json!({"args": 3}) };
        assert!(matches!(Extension::decode(&bad), Err(FerryError::Internal(_))));
        let unknown = ExtensionPayload { kind: "sidecar".into(), payload: Value::Null };
        assert!(matches!(Extension::decode(&unknown), Err(FerryError::Internal(_))));
    }

    #[test]
    fn conflicting_values_surface_both() {
        let mut sa = None;
        consolidate(&mut sa, &"a".to_string(), "service accounts").unwrap();
        consolidate(&mut sa, &"a".to_string(), "service accounts").unwrap();
        let err = consolidate(&mut sa, &"b".to_string(), "service accounts").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("\"a\"") && msg.contains("\"b\""));
    }

    #[test]
    fn env_merge_rejects_conflicts() {
        let mut env = vec![EnvVar::literal("MODE", "prod")];
        merge_envs(&mut env, &[EnvVar::literal("MODE", "prod"), EnvVar::literal("X", "1")]).unwrap();
        assert_eq!(env.len(), 2);
        assert!(matches!(merge_envs(&mut env, &[EnvVar::literal("MODE", "dev")]), Err(FerryError::BadInput(_))));
    }
}
