use std::collections::BTreeSet;

use async_trait::async_trait;
use ferry_core::naming::{ANN_RUNTIME_CONFIG, KIND_RUNTIME_CONFIG, LABEL_KIND};
use ferry_core::{sched, Gvk, OpCleanupRuntimeConfig, OpSpec, Operation, PlanOrderRules, Result, ScheduleOrder, WorkloadKind};
use ferry_kubehub::Target;
use serde_json::Value;
use tracing::{debug, info};

use crate::resolve::resolve_with_retry;
use crate::{ExecContext, Handler, HandlerResult, Inputs};

/// Garbage-collects runtime config maps once no workload points at them.
pub struct CleanupRuntimeConfigHandler;

fn referenced_config(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/annotations").and_then(|a| a.get(ANN_RUNTIME_CONFIG)).and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[async_trait]
impl Handler for CleanupRuntimeConfigHandler {
    fn kind(&self) -> &'static str { OpCleanupRuntimeConfig::KIND }

    fn plan_order(&self, op: &Operation, _rules: &PlanOrderRules) -> Result<ScheduleOrder> {
        let spec: OpCleanupRuntimeConfig = op.decode()?;
        let mut order = ScheduleOrder::default().after(sched::namespace_category(&spec.namespace));
        for kind in [WorkloadKind::Deployment, WorkloadKind::StatefulSet, WorkloadKind::DaemonSet, WorkloadKind::Pod] {
            let gvk = kind.gvk();
            order = order.after(sched::sched_category(&gvk.group, &gvk.kind));
        }
        Ok(order)
    }

    async fn handle(&self, ctx: &ExecContext, op: &Operation, _inputs: &Inputs) -> Result<HandlerResult> {
        let spec: OpCleanupRuntimeConfig = op.decode()?;
        let cluster = ctx.cluster.as_ref();
        let (wait, cancel) = (&ctx.options.wait, &ctx.cancel);

        let mut kinds = vec![WorkloadKind::Deployment, WorkloadKind::StatefulSet, WorkloadKind::DaemonSet];
        if spec.check_pods {
            kinds.push(WorkloadKind::Pod);
        }
        let mut referenced = BTreeSet::new();
        for kind in kinds {
            let target = Target::new(resolve_with_retry(cluster, &kind.gvk(), wait, cancel).await?, &spec.namespace);
            for obj in cluster.list(&target, "").await? {
                if let Some(id) = referenced_config(&obj) {
                    referenced.insert(id.to_string());
                }
            }
        }

        let cm = Target::new(resolve_with_retry(cluster, &Gvk::new("", "v1", "ConfigMap"), wait, cancel).await?, &spec.namespace);
        for obj in cluster.list(&cm, &format!("{}={}", LABEL_KIND, KIND_RUNTIME_CONFIG)).await? {
            let name = obj.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();
            if name.is_empty() || referenced.contains(name) {
                continue;
            }
            match cluster.delete(&cm, name).await {
                Ok(()) => info!(config = name, namespace = %spec.namespace, "deleted unused runtime config"),
                Err(e) if e.is_not_found() => debug!(config = name, "already gone"),
                Err(e) => return Err(e.context(&op.description)),
            }
        }
        Ok(HandlerResult::done())
    }
}
