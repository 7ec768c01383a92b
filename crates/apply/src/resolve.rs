//! Kind resolution with recovery from stale discovery, and the default
//! service account gate.

use ferry_core::{FerryError, Gvk, Result, WorkloadKind};
use ferry_kubehub::{ClusterApi, ResourceType, Target};
use ferry_ops::{poll_until, PollState, WaitConfig};
use ferry_schema::find_crd;
use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resolve `gvk`, retrying only on "no such resource": once after resetting the
/// cached mapping, then once more after waiting for a CRD that serves the kind
/// to become ready. Any other failure is returned as is.
pub async fn resolve_with_retry(cluster: &dyn ClusterApi, gvk: &Gvk, cfg: &WaitConfig, cancel: &CancellationToken) -> Result<ResourceType> {
    match cluster.resolve(gvk).await {
        Err(e) if e.is_no_match() => {}
        r => return r,
    }
    counter!("resolve_retries", 1u64);
    debug!(gvk = %gvk, "no match; resetting rest mapping");
    cluster.reset_mapping();

    let original = match cluster.resolve(gvk).await {
        Err(e) if e.is_no_match() => e,
        r => return r,
    };

    let crd = match find_crd(cluster, gvk).await {
        Ok(Some(crd)) => crd,
        Ok(None) => return Err(original),
        Err(e) => {
            debug!(gvk = %gvk, error = %e, "crd lookup failed");
            return Err(original);
        }
    };
    counter!("resolve_retries", 1u64);
    info!(crd = %crd.name, "waiting for custom resource definition");
    let hint = format!("kubectl describe crd {}", crd.name);
    poll_until(cfg, cancel, &format!("CustomResourceDefinition {}", crd.name), &hint, move || async move {
        Ok(match find_crd(cluster, gvk).await? {
            Some(c) if c.is_ready() => PollState::Ready,
            Some(_) => PollState::Pending("not established".into()),
            None => PollState::Pending("not found".into()),
        })
    })
    .await?;
    cluster.reset_mapping();
    cluster.resolve(gvk).await
}

/// Workloads that run under the namespace's `default` service account when
/// they name none (or name it explicitly).
pub fn uses_default_service_account(kind: WorkloadKind, obj: &Value) -> bool {
    if kind == WorkloadKind::DaemonSet {
        return false;
    }
    let sa = obj.pointer(&format!("{}/serviceAccountName", kind.pod_spec_pointer())).and_then(Value::as_str).unwrap_or_default();
    sa.is_empty() || sa == "default"
}

/// Block until `default` exists in `namespace`. The cluster creates it
/// asynchronously after the namespace, and pods are rejected until then.
pub async fn wait_for_default_service_account(cluster: &dyn ClusterApi, namespace: &str, cfg: &WaitConfig, cancel: &CancellationToken) -> Result<()> {
    let rt = resolve_with_retry(cluster, &Gvk::new("", "v1", "ServiceAccount"), cfg, cancel).await?;
    let target = Target::new(rt, namespace);
    match tokio::time::timeout(cfg.timeout, cluster.wait_until_exists(&target, "default", cancel.clone())).await {
        Ok(r) => r,
        Err(_) => Err(FerryError::DeadlineExceeded {
            what: format!("ServiceAccount {}/default", namespace),
            status: "not found".into(),
            hint: format!("kubectl -n {} get serviceaccounts", namespace),
        }),
    }
}
