//! Reading values back out of serialized runtime and resource configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deployable::{FieldSelector, ServiceRef};
use crate::{FerryError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerIdent {
    pub package_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ingress {
    pub base_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeService {
    pub name: String,
    /// `host:port`
    pub endpoint: String,
    pub ingress: Vec<Ingress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackEntry {
    pub server: ServerIdent,
    pub service: Vec<RuntimeService>,
}

/// The parts of `runtime.json` the executor reads; other keys pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeServices {
    pub stack_entry: Vec<StackEntry>,
}

impl RuntimeServices {
    pub fn parse(runtime_json: &str) -> Result<Self> {
        serde_json::from_str(runtime_json).map_err(|e| FerryError::internal(format!("failed to unmarshal runtime configuration: {}", e)))
    }

    fn service(&self, r: &ServiceRef) -> Result<&RuntimeService> {
        let entry = self
            .stack_entry
            .iter()
            .find(|e| e.server.package_name == r.server)
            .ok_or_else(|| FerryError::bad_input(format!("{}: server is not present in the runtime configuration", r.server)))?;
        entry
            .service
            .iter()
            .find(|s| s.name == r.service_name)
            .ok_or_else(|| FerryError::bad_input(format!("{}: no such service {:?}", r.server, r.service_name)))
    }

    pub fn endpoint(&self, r: &ServiceRef) -> Result<String> { Ok(self.service(r)?.endpoint.clone()) }

    pub fn ingress_base_url(&self, r: &ServiceRef) -> Result<String> {
        self.service(r)?
            .ingress
            .first()
            .map(|i| i.base_url.clone())
            .ok_or_else(|| FerryError::bad_input(format!("{}/{}: service has no ingress", r.server, r.service_name)))
    }
}

/// `resources.json`: resource reference -> instance.
pub type ResourceData = BTreeMap<String, Value>;

pub fn parse_resource_data(resource_json: &str) -> Result<ResourceData> {
    if resource_json.is_empty() {
        return Ok(ResourceData::new());
    }
    serde_json::from_str(resource_json).map_err(|e| FerryError::internal(format!("failed to unmarshal resource configuration: {}", e)))
}

/// Walk a dotted selector through nested maps of one resource instance.
pub fn select_field(data: &ResourceData, sel: &FieldSelector) -> Result<Value> {
    let mut cur = data
        .get(&sel.resource)
        .ok_or_else(|| FerryError::NotFound(format!("no instance found for resource {:?}", sel.resource)))?;
    if sel.field_selector.is_empty() {
        return Ok(cur.clone());
    }
    for part in sel.field_selector.split('.') {
        if part.is_empty() {
            return Err(FerryError::bad_input(format!("{}: invalid field selector", sel.resource)));
        }
        cur = match cur {
            Value::Object(m) => match m.get(part) {
                Some(Value::Null) => return Err(FerryError::NotFound(format!("{}: {}: no value set", sel.resource, sel.field_selector))),
                Some(v) => v,
                None => return Err(FerryError::NotFound(format!("{}: {}: selector doesn't match a value", sel.resource, sel.field_selector))),
            },
            other => return Err(FerryError::bad_input(format!("{}: cannot select {:?} from a {}", sel.resource, part, json_type(other)))),
        };
    }
    Ok(cur.clone())
}

pub fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
