use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::{prepare_event, DeployableRef, Event, FerryError, Gvk, Ready, Result, Stage, WaitStatus, WorkloadKind};
use ferry_kubehub::{ClusterApi, Target};
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::status::{container_failures, evaluate_generation, parse_pod_status, pod_done, wait_status_from_pod, ReplicaCounts};
use crate::{poll_until, PollState, WaitConfig, Waiter};

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

fn hint(gvk: &Gvk, ns: &str, name: &str) -> String { format!("kubectl -n {} describe {} {}", ns, gvk.kind.to_lowercase(), name) }

async fn send(events: &mpsc::Sender<Event>, ev: Event) {
    // A gone receiver only means nobody is watching progress.
    let _ = events.send(ev).await;
}

fn selector_string(labels: &serde_json::Map<String, Value>) -> String {
    labels.iter().filter_map(|(k, v)| v.as_str().map(|v| format!("{}={}", k, v))).collect::<Vec<_>>().join(",")
}

/// Waits for a Deployment/StatefulSet/DaemonSet to observe the applied
/// generation with all replicas ready and updated.
pub struct GenerationWaiter {
    pub cluster: Arc<dyn ClusterApi>,
    pub target: Target,
    pub kind: WorkloadKind,
    pub name: String,
    pub description: String,
    pub deployable: Option<DeployableRef>,
    pub previous_generation: i64,
    pub expected_generation: i64,
    pub config: WaitConfig,
}

impl GenerationWaiter {
    fn namespace(&self) -> &str { self.target.namespace.as_deref().unwrap_or_default() }

    /// Pods of the newest ReplicaSet owned by the deployment, or the pods of a
    /// StatefulSet's update revision.
    async fn pod_statuses(&self, obj: &Value) -> Result<Vec<WaitStatus>> {
        let ns = self.namespace();
        let match_labels = obj.pointer("/spec/selector/matchLabels").and_then(Value::as_object).cloned().unwrap_or_default();
        let pod_selector = match self.kind {
            WorkloadKind::Deployment => {
                let rs_target = Target::new(self.cluster.resolve(&Gvk::new("apps", "v1", "ReplicaSet")).await?, ns);
                let uid = obj.pointer("/metadata/uid").and_then(Value::as_str).unwrap_or_default();
                let owned = self.cluster.list(&rs_target, &selector_string(&match_labels)).await?.into_iter().filter(|rs| {
                    rs.pointer("/metadata/ownerReferences")
                        .and_then(Value::as_array)
                        .is_some_and(|refs| refs.iter().any(|r| r.get("uid").and_then(Value::as_str) == Some(uid)))
                });
                let newest = owned
                    .max_by_key(|rs| {
                        rs.pointer("/metadata/annotations")
                            .and_then(|a| a.get(REVISION_ANNOTATION))
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse::<i64>().ok())
                            .unwrap_or(0)
                    })
                    .ok_or_else(|| FerryError::NotFound(format!("replica set for {}/{}", ns, self.name)))?;
                let hash = newest
                    .pointer("/metadata/labels/pod-template-hash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FerryError::NotFound(format!("pod-template-hash for {}/{}", ns, self.name)))?;
                let mut sel = match_labels.clone();
                sel.insert("pod-template-hash".into(), Value::String(hash.to_string()));
                selector_string(&sel)
            }
            WorkloadKind::StatefulSet => {
                let rev = obj
                    .pointer("/status/updateRevision")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FerryError::NotFound(format!("update revision for {}/{}", ns, self.name)))?;
                let mut sel = match_labels.clone();
                sel.insert("controller-revision-hash".into(), Value::String(rev.to_string()));
                selector_string(&sel)
            }
            WorkloadKind::DaemonSet | WorkloadKind::Pod => return Ok(Vec::new()),
        };
        let pods_target = Target::new(self.cluster.resolve(&WorkloadKind::Pod.gvk()).await?, ns);
        Ok(self.cluster.list(&pods_target, &pod_selector).await?.iter().filter_map(wait_status_from_pod).collect())
    }

    async fn poll_once(&self, events: &mpsc::Sender<Event>) -> Result<PollState> {
        let Some(obj) = self.cluster.get(&self.target, &self.name).await? else {
            // Not visible yet; the only way here is having asked for it to be created.
            return Ok(PollState::Pending("not found".into()));
        };
        let counts = ReplicaCounts::from_object(self.kind, &obj);
        let mut ev = self.event();
        match self.pod_statuses(&obj).await {
            Ok(ws) => ev.wait_status = ws,
            Err(e) => debug!(error = %e, name = %self.name, "pod status unavailable"),
        }
        ev.ready = evaluate_generation(self.expected_generation, &counts);
        ev.stage = if ev.ready == Ready::Ready { Stage::Done } else { Stage::Waiting };
        ev.wait_details = counts.describe(self.expected_generation);
        let ready = ev.ready == Ready::Ready;
        send(events, ev).await;
        Ok(if ready { PollState::Ready } else { PollState::Pending(counts.describe(self.expected_generation)) })
    }

    fn event(&self) -> Event {
        let gvk = self.kind.gvk();
        let mut ev = prepare_event(&gvk, self.namespace(), &self.name, &self.description, self.deployable.as_ref());
        ev.stage = Stage::Waiting;
        ev.already_existed = self.previous_generation > 0 && self.previous_generation == self.expected_generation;
        ev
    }
}

#[async_trait]
impl Waiter for GenerationWaiter {
    fn describe(&self) -> String { format!("{} {}/{}", self.kind.gvk().kind, self.namespace(), self.name) }

    async fn wait(&self, events: mpsc::Sender<Event>, cancel: CancellationToken) -> Result<()> {
        send(&events, self.event()).await;
        let hint = hint(&self.kind.gvk(), self.namespace(), &self.name);
        poll_until(&self.config, &cancel, &self.describe(), &hint, || self.poll_once(&events)).await?;
        counter!("wait_ready", 1u64);
        info!(what = %self.describe(), generation = self.expected_generation, "converged");
        Ok(())
    }
}

/// Which pods a [`PodWaiter`] tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodSelector {
    Name(String),
    Labels(String),
}

/// Waits until every selected pod finished or became ready. Pods that never
/// restart fail the wait as soon as a container exits non-zero.
pub struct PodWaiter {
    pub cluster: Arc<dyn ClusterApi>,
    pub namespace: String,
    pub selector: PodSelector,
    pub description: String,
    pub deployable: Option<DeployableRef>,
    pub config: WaitConfig,
}

impl PodWaiter {
    fn name(&self) -> &str {
        match &self.selector {
            PodSelector::Name(n) => n,
            PodSelector::Labels(l) => l,
        }
    }

    async fn pods(&self) -> Result<Vec<Value>> {
        let target = Target::new(self.cluster.resolve(&WorkloadKind::Pod.gvk()).await?, &self.namespace);
        match &self.selector {
            PodSelector::Name(n) => Ok(self.cluster.get(&target, n).await?.into_iter().collect()),
            PodSelector::Labels(l) => self.cluster.list(&target, l).await,
        }
    }

    async fn poll_once(&self, events: &mpsc::Sender<Event>) -> Result<PollState> {
        let pods = self.pods().await?;
        let mut ev = prepare_event(&WorkloadKind::Pod.gvk(), &self.namespace, self.name(), &self.description, self.deployable.as_ref());
        ev.stage = Stage::Waiting;
        let mut done = 0usize;
        for pod in &pods {
            if let Some(failure) = container_failures(pod) {
                return Err(failure.into());
            }
            if let Some(ws) = wait_status_from_pod(pod) {
                ev.wait_status.push(ws);
            }
            if parse_pod_status(pod).is_some_and(|ps| pod_done(&ps)) {
                done += 1;
            }
        }
        let ready = done > 0 && done == pods.len();
        if ready {
            ev.ready = Ready::Ready;
            ev.stage = Stage::Done;
        }
        ev.wait_details = format!("{} / {}", done, pods.len());
        send(events, ev).await;
        Ok(if ready { PollState::Ready } else { PollState::Pending(format!("{} of {} pods done", done, pods.len())) })
    }
}

#[async_trait]
impl Waiter for PodWaiter {
    fn describe(&self) -> String { format!("Pod {}/{}", self.namespace, self.name()) }

    async fn wait(&self, events: mpsc::Sender<Event>, cancel: CancellationToken) -> Result<()> {
        let hint = hint(&WorkloadKind::Pod.gvk(), &self.namespace, self.name());
        poll_until(&self.config, &cancel, &self.describe(), &hint, || self.poll_once(&events)).await?;
        counter!("wait_ready", 1u64);
        Ok(())
    }
}

/// Waits until an object reports `condition_type=True` for the generation that was applied.
pub struct GenerationConditionWaiter {
    pub cluster: Arc<dyn ClusterApi>,
    pub target: Target,
    pub name: String,
    pub description: String,
    pub expected_generation: i64,
    pub condition_type: String,
    pub config: WaitConfig,
}

/// Generation the condition speaks for: its own `observedGeneration`, else the status'.
pub fn condition_satisfied(obj: &Value, condition_type: &str, expected_generation: i64) -> bool {
    let status_gen = obj.pointer("/status/observedGeneration").and_then(Value::as_i64);
    obj.pointer("/status/conditions").and_then(Value::as_array).is_some_and(|cs| {
        cs.iter().any(|c| {
            let gen = c.get("observedGeneration").and_then(Value::as_i64).or(status_gen);
            c.get("type").and_then(Value::as_str) == Some(condition_type)
                && c.get("status").and_then(Value::as_str) == Some("True")
                && gen.is_some_and(|g| g >= expected_generation)
        })
    })
}

impl GenerationConditionWaiter {
    fn namespace(&self) -> &str { self.target.namespace.as_deref().unwrap_or_default() }

    async fn poll_once(&self, events: &mpsc::Sender<Event>) -> Result<PollState> {
        let gvk = &self.target.resource.gvk;
        let mut ev = prepare_event(gvk, self.namespace(), &self.name, &self.description, None);
        ev.stage = Stage::Waiting;
        let ready = match self.cluster.get(&self.target, &self.name).await? {
            Some(obj) => condition_satisfied(&obj, &self.condition_type, self.expected_generation),
            None => false,
        };
        if ready {
            ev.ready = Ready::Ready;
            ev.stage = Stage::Done;
        }
        send(events, ev).await;
        Ok(if ready { PollState::Ready } else { PollState::Pending(format!("waiting for {} at generation {}", self.condition_type, self.expected_generation)) })
    }
}

#[async_trait]
impl Waiter for GenerationConditionWaiter {
    fn describe(&self) -> String { format!("{} {}/{}", self.target.resource.gvk.kind, self.namespace(), self.name) }

    async fn wait(&self, events: mpsc::Sender<Event>, cancel: CancellationToken) -> Result<()> {
        let hint = hint(&self.target.resource.gvk, self.namespace(), &self.name);
        poll_until(&self.config, &cancel, &self.describe(), &hint, || self.poll_once(&events)).await?;
        counter!("wait_ready", 1u64);
        Ok(())
    }
}
