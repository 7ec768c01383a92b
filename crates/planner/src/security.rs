//! Pod and container security contexts.

use ferry_core::{ContainerSpec, FerryError, Purpose, Result, RunAs};
use serde_json::{json, Map, Value};

use crate::extensions::{consolidate, PodSecurityOverride};

fn parse_id(field: &str, v: &Option<String>) -> Result<Option<i64>> {
    v.as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().map_err(|_| FerryError::bad_input(format!("{}: expected a numeric id, got {:?}", field, s))))
        .transpose()
}

/// Pod security context used when no extension supplies one.
pub fn default_pod_security(purpose: Purpose) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("seccompProfile".into(), json!({"type": "RuntimeDefault"}));
    if purpose == Purpose::Production {
        m.insert("fsGroupChangePolicy".into(), json!("OnRootMismatch"));
    }
    m
}

/// Pod-level ids, shared by every container that declares them.
#[derive(Debug, Default)]
pub struct PodSecurity {
    run_as_user: Option<i64>,
    fs_group: Option<i64>,
    run_as_group: Option<i64>,
    overridden: bool,
}

impl PodSecurity {
    pub fn add_run_as(&mut self, run_as: &RunAs) -> Result<()> {
        if let Some(uid) = parse_id("runAs.userId", &run_as.user_id)? {
            consolidate(&mut self.run_as_user, &uid, "runAs.userId")?;
        }
        if let Some(gid) = parse_id("runAs.fsGroup", &run_as.fs_group)? {
            consolidate(&mut self.fs_group, &gid, "runAs.fsGroup")?;
        }
        Ok(())
    }

    pub fn add_override(&mut self, o: &PodSecurityOverride) -> Result<()> {
        self.overridden = true;
        if let Some(uid) = o.run_as_user {
            consolidate(&mut self.run_as_user, &uid, "securityContext.runAsUser")?;
        }
        if let Some(gid) = o.run_as_group {
            consolidate(&mut self.run_as_group, &gid, "securityContext.runAsGroup")?;
        }
        if let Some(fs) = o.fs_group {
            consolidate(&mut self.fs_group, &fs, "securityContext.fsGroup")?;
        }
        Ok(())
    }

    /// A privileged main container forces the pod to run as root.
    pub fn render(&self, purpose: Purpose, privileged: bool) -> Option<Value> {
        let mut m = if self.overridden { Map::new() } else { default_pod_security(purpose) };
        if let Some(v) = self.run_as_user {
            m.insert("runAsUser".into(), v.into());
        }
        if let Some(v) = self.run_as_group {
            m.insert("runAsGroup".into(), v.into());
        }
        if let Some(v) = self.fs_group {
            m.insert("fsGroup".into(), v.into());
        }
        if privileged {
            m.insert("runAsUser".into(), 0.into());
            m.insert("runAsGroup".into(), 0.into());
        }
        (!m.is_empty()).then_some(Value::Object(m))
    }
}

pub fn container_security(c: &ContainerSpec) -> Option<Value> {
    match (c.privileged, c.read_only_filesystem) {
        (false, false) => None,
        (true, ro) => Some(json!({"privileged": true, "runAsUser": 0, "runAsGroup": 0, "readOnlyRootFilesystem": ro})),
        (false, true) => Some(json!({"readOnlyRootFilesystem": true})),
    }
}
