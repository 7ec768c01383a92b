//! Gathers the secrets a deployable references into cluster Secrets.

use std::collections::BTreeMap;

use ferry_core::naming::label_like;
use ferry_core::{FerryError, OpApply, OpCreate, Operation, Result, SecretSpec, SecretValue};
use serde_json::{json, Value};
use uuid::Uuid;

const GENERATED_KEY: &str = "generated";

/// Where a secret value ends up: a Secret name and a key inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretAlloc {
    pub name: String,
    pub key: String,
}

#[derive(Debug)]
struct Generated {
    alloc: SecretAlloc,
    value: String,
}

/// Static values land in one managed Secret per deployable; generated ones get
/// a Secret each, created once and never overwritten.
#[derive(Debug)]
pub struct SecretCollector<'a> {
    secrets: Option<&'a [SecretSpec]>,
    managed_name: String,
    items: BTreeMap<String, String>,
    generated: Vec<Generated>,
}

pub fn managed_secret_name(name: &str, id: &str) -> String { format!("ferry-managed-{}-{}", label_like(name), id) }

impl<'a> SecretCollector<'a> {
    pub fn new(secrets: Option<&'a [SecretSpec]>, managed_name: String) -> Self {
        Self { secrets, managed_name, items: BTreeMap::new(), generated: Vec::new() }
    }

    pub fn managed_name(&self) -> &str { &self.managed_name }

    pub fn allocate(&mut self, name: &str) -> Result<SecretAlloc> {
        let secrets = self.secrets.ok_or_else(|| FerryError::bad_input(format!("{}: secrets are not available in this context", name)))?;
        let spec = secrets.iter().find(|s| s.name == name).ok_or_else(|| FerryError::bad_input(format!("{}: no such secret", name)))?;
        match &spec.value {
            SecretValue::Static(v) => {
                let key = label_like(name);
                self.items.insert(key.clone(), v.clone());
                Ok(SecretAlloc { name: self.managed_name.clone(), key })
            }
            SecretValue::Generate { unique_key } => Ok(self.allocate_generated(unique_key.as_deref().unwrap_or(name))),
        }
    }

    fn allocate_generated(&mut self, unique_key: &str) -> SecretAlloc {
        let name = format!("ferry-generated-{}", label_like(unique_key));
        if let Some(g) = self.generated.iter().find(|g| g.alloc.name == name) {
            return g.alloc.clone();
        }
        let alloc = SecretAlloc { name, key: GENERATED_KEY.to_string() };
        let value = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.generated.push(Generated { alloc: alloc.clone(), value });
        alloc
    }

    /// Operations that materialize everything allocated so far.
    pub fn plan(&self, namespace: &str, labels: &BTreeMap<String, String>, annotations: &BTreeMap<String, String>) -> Result<Vec<Operation>> {
        let meta = |name: &str| -> Value { json!({"name": name, "namespace": namespace, "labels": labels, "annotations": annotations}) };
        let mut ops = Vec::new();
        if !self.items.is_empty() {
            let secret = json!({"apiVersion": "v1", "kind": "Secret", "metadata": meta(&self.managed_name), "type": "Opaque", "stringData": self.items});
            ops.push(Operation::new("Managed secrets", &OpApply { resource: Some(secret), ..Default::default() })?);
        }
        for g in &self.generated {
            let secret = json!({
                "apiVersion": "v1", "kind": "Secret", "metadata": meta(&g.alloc.name), "type": "Opaque",
                "stringData": {g.alloc.key.as_str(): g.value},
            });
            ops.push(Operation::new(format!("Generated secret {}", g.alloc.name), &OpCreate { resource: Some(secret), skip_if_already_exists: true })?);
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<SecretSpec> {
        vec![
            SecretSpec { name: "api-key".into(), value: SecretValue::Static("s3cr3t".into()) },
            SecretSpec { name: "session".into(), value: SecretValue::Generate { unique_key: Some("shop-session".into()) } },
        ]
    }

    #[test]
    fn static_and_generated_allocations() {
        let s = specs();
        let mut c = SecretCollector::new(Some(&s), managed_secret_name("Api", "abc"));
        let a = c.allocate("api-key").unwrap();
        assert_eq!(a, SecretAlloc { name: "ferry-managed-api-abc".into(), key: "api-key".into() });
        let g1 = c.allocate("session").unwrap();
        let g2 = c.allocate("session").unwrap();
        assert_eq!(g1, g2);
        assert_eq!(g1.name, "ferry-generated-shop-session");
        let ops = c.plan("shop", &BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, "ferry.kubernetes.apply");
        let create: OpCreate = ops[1].decode().unwrap();
        assert!(create.skip_if_already_exists);
        assert_eq!(create.resource.unwrap()["stringData"]["generated"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn missing_secrets_are_bad_input() {
        let mut unwired = SecretCollector::new(None, "m".into());
        assert!(matches!(unwired.allocate("api-key"), Err(FerryError::BadInput(_))));
        let s = specs();
        let mut c = SecretCollector::new(Some(&s), "m".into());
        assert!(matches!(c.allocate("nope"), Err(FerryError::BadInput(_))));
        assert!(c.plan("shop", &BTreeMap::new(), &BTreeMap::new()).unwrap().is_empty());
    }
}
