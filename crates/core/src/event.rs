//! Per-operation progress records streamed to observers.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::deployable::DeployableRef;
use crate::gvk::{Gvk, WorkloadKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ready {
    #[default]
    NotReady,
    Ready,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Planned,
    Waiting,
    Committed,
    Running,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerWaitStatus {
    /// `namespace/pod/container`
    pub reference: String,
    pub name: String,
    pub ready: bool,
    pub waiting_reason: Option<String>,
    pub terminated_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub crash_loop_back_off: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitStatus {
    pub description: String,
    pub containers: SmallVec<[ContainerWaitStatus; 2]>,
    pub initializers: SmallVec<[ContainerWaitStatus; 2]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    /// `namespace/name`
    pub resource_id: String,
    pub category: String,
    pub scope: String,
    pub ready: Ready,
    pub stage: Stage,
    pub wait_status: Vec<WaitStatus>,
    pub wait_details: String,
    pub runtime_specific_help: String,
    /// The object was already at the expected generation before apply.
    pub already_existed: bool,
    pub timestamp: String,
}

const SERVERS_DEPLOYED: &str = "Servers deployed";

fn is_server(gvk: &Gvk, deployable: Option<&DeployableRef>) -> bool {
    if deployable.is_some_and(|d| d.class.is_one_shot_like()) {
        return false;
    }
    matches!(WorkloadKind::from_gvk(gvk), Some(WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::Pod))
}

/// Skeleton event for an object, not ready and stamped now.
pub fn prepare_event(gvk: &Gvk, namespace: &str, name: &str, description: &str, deployable: Option<&DeployableRef>) -> Event {
    let category = if is_server(gvk, deployable) { SERVERS_DEPLOYED.to_string() } else { description.to_string() };
    Event {
        resource_id: format!("{}/{}", namespace, name),
        category,
        scope: deployable.map(|d| d.package_name.clone()).unwrap_or_default(),
        ready: Ready::NotReady,
        runtime_specific_help: format!("kubectl -n {} describe {} {}", namespace, gvk.kind.to_lowercase(), name),
        timestamp: chrono::Utc::now().to_rfc3339(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployable::DeployableClass;

    #[test]
    fn servers_share_a_category() {
        let gvk = Gvk::new("apps", "v1", "Deployment");
        let d = DeployableRef { name: "api".into(), package_name: "acme/api".into(), ..Default::default() };
        let ev = prepare_event(&gvk, "ns", "api-1", "Server Deployment api", Some(&d));
        assert_eq!(ev.category, "Servers deployed");
        assert_eq!(ev.resource_id, "ns/api-1");
        assert_eq!(ev.runtime_specific_help, "kubectl -n ns describe deployment api-1");
        assert_eq!(ev.scope, "acme/api");
        assert_eq!(ev.ready, Ready::NotReady);
    }

    #[test]
    fn one_shots_and_other_kinds_use_the_description() {
        let pod = Gvk::new("", "v1", "Pod");
        let d = DeployableRef { class: DeployableClass::OneShot, ..Default::default() };
        assert_eq!(prepare_event(&pod, "ns", "job", "One-shot job", Some(&d)).category, "One-shot job");
        let ds = Gvk::new("apps", "v1", "DaemonSet");
        assert_eq!(prepare_event(&ds, "ns", "d", "Server DaemonSet d", None).category, "Server DaemonSet d");
    }
}
