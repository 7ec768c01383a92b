//! Pure status derivation: replica readiness, pod wait status, container failures.

use ferry_core::{ContainerFailure, ContainerWaitStatus, FailedContainer, Ready, WaitStatus, WorkloadKind};
use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
use serde_json::Value;

pub fn are_replicas_ready(replicas: i32, ready: i32, updated: i32) -> bool { ready == replicas && updated == replicas && replicas > 0 }

/// Replica counters as read from a workload's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub observed_generation: i64,
    pub replicas: i32,
    pub ready: i32,
    pub updated: i32,
}

fn int(v: &Value, p: &str) -> i64 { v.pointer(p).and_then(Value::as_i64).unwrap_or(0) }

impl ReplicaCounts {
    /// DaemonSets report availability under different names.
    pub fn from_object(kind: WorkloadKind, obj: &Value) -> Self {
        let observed_generation = int(obj, "/status/observedGeneration");
        let (replicas, ready, updated) = match kind {
            WorkloadKind::DaemonSet => ("/status/numberAvailable", "/status/numberReady", "/status/updatedNumberScheduled"),
            _ => ("/status/replicas", "/status/readyReplicas", "/status/updatedReplicas"),
        };
        Self { observed_generation, replicas: int(obj, replicas) as i32, ready: int(obj, ready) as i32, updated: int(obj, updated) as i32 }
    }

    pub fn describe(&self, expected_generation: i64) -> String {
        format!(
            "generation {}/{}, ready {}/{}, updated {}/{}",
            self.observed_generation, expected_generation, self.ready, self.replicas, self.updated, self.replicas
        )
    }
}

/// Ready iff a newer generation was observed, or the expected one is observed with
/// every replica ready and updated.
pub fn evaluate_generation(expected_generation: i64, counts: &ReplicaCounts) -> Ready {
    if counts.observed_generation > expected_generation {
        return Ready::Ready;
    }
    if counts.observed_generation == expected_generation && are_replicas_ready(counts.replicas, counts.ready, counts.updated) {
        return Ready::Ready;
    }
    Ready::NotReady
}

pub fn generation_of(obj: &Value) -> Option<i64> { obj.pointer("/metadata/generation").and_then(Value::as_i64) }

pub fn parse_pod_status(pod: &Value) -> Option<PodStatus> { pod.get("status").and_then(|s| serde_json::from_value(s.clone()).ok()) }

fn pod_ident(pod: &Value) -> (String, String) {
    let s = |p: &str| pod.pointer(p).and_then(Value::as_str).unwrap_or_default().to_string();
    (s("/metadata/namespace"), s("/metadata/name"))
}

fn container_wait_status(ns: &str, pod: &str, cs: &ContainerStatus) -> ContainerWaitStatus {
    let state = cs.state.as_ref();
    let waiting_reason = state.and_then(|s| s.waiting.as_ref()).and_then(|w| w.reason.clone());
    let terminated = state.and_then(|s| s.terminated.as_ref());
    ContainerWaitStatus {
        reference: format!("{}/{}/{}", ns, pod, cs.name),
        name: cs.name.clone(),
        ready: cs.ready,
        crash_loop_back_off: waiting_reason.as_deref() == Some("CrashLoopBackOff"),
        waiting_reason,
        terminated_reason: terminated.and_then(|t| t.reason.clone()),
        exit_code: terminated.map(|t| t.exit_code),
    }
}

pub fn wait_status_from_pod_status(ns: &str, pod: &str, ps: &PodStatus) -> WaitStatus {
    let phase = ps.phase.clone().unwrap_or_else(|| "Unknown".to_string());
    WaitStatus {
        description: format!("{}/{}: {}", ns, pod, phase),
        containers: ps.container_statuses.iter().flatten().map(|c| container_wait_status(ns, pod, c)).collect(),
        initializers: ps.init_container_statuses.iter().flatten().map(|c| container_wait_status(ns, pod, c)).collect(),
    }
}

/// Wait status of an unstructured pod; `None` when it carries no status yet.
pub fn wait_status_from_pod(pod: &Value) -> Option<WaitStatus> {
    let (ns, name) = pod_ident(pod);
    parse_pod_status(pod).map(|ps| wait_status_from_pod_status(&ns, &name, &ps))
}

pub fn match_pod_condition(ps: &PodStatus, condition_type: &str) -> bool {
    ps.conditions.iter().flatten().any(|c| c.type_ == condition_type && c.status == "True")
}

/// Finished (either way) or `Ready`.
pub fn pod_done(ps: &PodStatus) -> bool {
    matches!(ps.phase.as_deref(), Some("Failed") | Some("Succeeded")) || match_pod_condition(ps, "Ready")
}

/// For pods that will never restart a container: every container (init ones
/// included) that terminated with a non-zero exit code.
pub fn container_failures(pod: &Value) -> Option<ContainerFailure> {
    if pod.pointer("/spec/restartPolicy").and_then(Value::as_str) != Some("Never") {
        return None;
    }
    let ps = parse_pod_status(pod)?;
    let (ns, name) = pod_ident(pod);
    let failed: Vec<FailedContainer> = ps
        .init_container_statuses
        .iter()
        .flatten()
        .chain(ps.container_statuses.iter().flatten())
        .filter_map(|cs| {
            let t = cs.state.as_ref()?.terminated.as_ref()?;
            (t.exit_code != 0).then(|| FailedContainer {
                namespace: ns.clone(),
                pod: name.clone(),
                container: cs.name.clone(),
                reason: t.reason.clone().unwrap_or_default(),
                message: t.message.clone().unwrap_or_default(),
                exit_code: t.exit_code,
            })
        })
        .collect();
    if failed.is_empty() {
        return None;
    }
    let reason = failed.iter().map(|f| format!("{}: {}: exit code {}", f.container, f.reason, f.exit_code)).collect::<Vec<_>>().join("; ");
    Some(ContainerFailure { name: format!("{}/{}", ns, name), reason, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counts(observed: i64, replicas: i32, ready: i32, updated: i32) -> ReplicaCounts { ReplicaCounts { observed_generation: observed, replicas, ready, updated } }

    #[test]
    fn generation_evaluation() {
        assert_eq!(evaluate_generation(2, &counts(3, 0, 0, 0)), Ready::Ready);
        assert_eq!(evaluate_generation(2, &counts(2, 1, 1, 1)), Ready::Ready);
        assert_eq!(evaluate_generation(2, &counts(2, 2, 1, 2)), Ready::NotReady);
        assert_eq!(evaluate_generation(2, &counts(2, 0, 0, 0)), Ready::NotReady);
        assert_eq!(evaluate_generation(2, &counts(1, 1, 1, 1)), Ready::NotReady);
    }

    #[test]
    fn daemonset_counts_use_availability() {
        let ds = json!({"status": {"observedGeneration": 4, "numberAvailable": 3, "numberReady": 3, "updatedNumberScheduled": 2}});
        let c = ReplicaCounts::from_object(WorkloadKind::DaemonSet, &ds);
        assert_eq!(c, counts(4, 3, 3, 2));
        assert_eq!(evaluate_generation(4, &c), Ready::NotReady);
        let d = json!({"status": {"observedGeneration": 1, "replicas": 2, "readyReplicas": 2, "updatedReplicas": 2}});
        assert_eq!(ReplicaCounts::from_object(WorkloadKind::Deployment, &d), counts(1, 2, 2, 2));
    }

    fn container(name: &str, state: serde_json::Value) -> serde_json::Value {
        json!({"name": name, "image": "img", "imageID": "", "ready": false, "restartCount": 0, "state": state})
    }

    fn pod(restart: &str, phase: &str, containers: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"namespace": "ns", "name": "job-1"},
            "spec": {"restartPolicy": restart, "containers": []},
            "status": {"phase": phase, "containerStatuses": containers}
        })
    }

    #[test]
    fn failed_containers_in_never_restart_pods() {
        let p = pod("Never", "Running", vec![
            container("main", json!({"terminated": {"exitCode": 3, "reason": "Error", "message": "boom"}})),
            container("side", json!({"running": {}})),
        ]);
        let f = container_failures(&p).unwrap();
        assert_eq!(f.name, "ns/job-1");
        assert_eq!(f.failed.len(), 1);
        assert_eq!(f.failed[0].reference(), "ns/job-1/main");
        assert_eq!(f.failed[0].exit_code, 3);
        assert_eq!(f.reason, "main: Error: exit code 3");
    }

    #[test]
    fn restartable_pods_never_fail_fast() {
        let p = pod("Always", "Running", vec![container("main", json!({"terminated": {"exitCode": 1}}))]);
        assert!(container_failures(&p).is_none());
        let ok = pod("Never", "Succeeded", vec![container("main", json!({"terminated": {"exitCode": 0}}))]);
        assert!(container_failures(&ok).is_none());
    }

    #[test]
    fn wait_status_reports_crash_loops() {
        let p = pod("Always", "Running", vec![container("main", json!({"waiting": {"reason": "CrashLoopBackOff"}}))]);
        let ws = wait_status_from_pod(&p).unwrap();
        assert_eq!(ws.description, "ns/job-1: Running");
        assert!(ws.containers[0].crash_loop_back_off);
        assert_eq!(ws.containers[0].reference, "ns/job-1/main");
    }

    #[test]
    fn pods_are_done_when_finished_or_ready() {
        let ps: PodStatus = serde_json::from_value(json!({"phase": "Succeeded"})).unwrap();
        assert!(pod_done(&ps));
        let ps: PodStatus = serde_json::from_value(json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]})).unwrap();
        assert!(pod_done(&ps));
        let ps: PodStatus = serde_json::from_value(json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]})).unwrap();
        assert!(!pod_done(&ps));
    }
}
