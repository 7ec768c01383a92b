use std::time::Instant;

use async_trait::async_trait;
use ferry_core::{
    prepare_event, DeployableRef, FerryError, GenerationCondition, Gvk, OpApply, OpSpec, Operation, PlanOrderRules, Result, ScheduleOrder, Stage, WorkloadKind,
};
use ferry_kubehub::Target;
use ferry_ops::{status::generation_of, GenerationConditionWaiter, GenerationWaiter, PodSelector, PodWaiter, Waiter};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info};

use crate::resolve::{resolve_with_retry, uses_default_service_account, wait_for_default_service_account};
use crate::{ExecContext, Handler, HandlerResult, Inputs};

/// One object to patch-apply and how to follow up on it.
#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    pub description: &'a str,
    pub object: &'a Value,
    pub inhibit_events: bool,
    pub generation_condition: Option<&'a GenerationCondition>,
    pub deployable: Option<&'a DeployableRef>,
}

impl<'a> ApplyRequest<'a> {
    pub fn new(description: &'a str, object: &'a Value) -> Self {
        Self { description, object, inhibit_events: false, generation_condition: None, deployable: None }
    }
}

fn str_at<'v>(obj: &'v Value, p: &str) -> &'v str { obj.pointer(p).and_then(Value::as_str).unwrap_or_default() }

/// Schedule order of an object, read from its own identity.
pub(crate) fn object_order(obj: &Value, rules: &PlanOrderRules) -> Result<ScheduleOrder> {
    let gvk = Gvk::of(obj)?;
    Ok(ferry_core::plan_order_with(rules, &gvk, str_at(obj, "/metadata/namespace"), str_at(obj, "/metadata/name")))
}

/// Patch-apply `req.object` and return the waiter that tracks its convergence, if any.
pub async fn apply_object(ctx: &ExecContext, req: ApplyRequest<'_>) -> Result<Option<Box<dyn Waiter>>> {
    let t0 = Instant::now();
    counter!("apply_attempts", 1u64);
    let gvk = Gvk::of(req.object)?;
    if gvk.version.is_empty() {
        return Err(FerryError::internal(format!("{}: apiVersion has no version", req.description)));
    }
    let name = str_at(req.object, "/metadata/name");
    if name.is_empty() {
        return Err(FerryError::internal(format!("{}: metadata.name is required", req.description)));
    }
    let ns = str_at(req.object, "/metadata/namespace");
    let cluster = ctx.cluster.as_ref();
    let rt = resolve_with_retry(cluster, &gvk, &ctx.options.wait, &ctx.cancel).await.map_err(|e| e.context(req.description))?;
    let target = Target::new(rt, ns);
    let workload = WorkloadKind::from_gvk(&gvk);

    if let Some(kind) = workload {
        if !ns.is_empty() && uses_default_service_account(kind, req.object) {
            debug!(namespace = ns, "waiting for default service account");
            wait_for_default_service_account(cluster, ns, &ctx.options.wait, &ctx.cancel).await?;
        }
    }

    let applied = match cluster.apply(&target, name, req.object, &ctx.options.field_manager).await {
        Ok(v) => v,
        Err(e) => {
            counter!("apply_err", 1u64);
            return Err(e.context(req.description));
        }
    };
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    info!(what = %target.describe(name), "applied");

    if !req.inhibit_events && matches!(workload, Some(WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::Pod)) {
        let mut ev = prepare_event(&gvk, ns, name, req.description, req.deployable);
        ev.stage = Stage::Committed;
        ctx.emit(ev).await;
    }

    if let Some(cond) = req.generation_condition {
        let expected_generation =
            generation_of(&applied).ok_or_else(|| FerryError::internal(format!("{}: failed to wait on resource: no metadata.generation", req.description)))?;
        return Ok(Some(Box::new(GenerationConditionWaiter {
            cluster: ctx.cluster.clone(),
            target,
            name: name.to_string(),
            description: req.description.to_string(),
            expected_generation,
            condition_type: cond.condition_type.clone(),
            config: ctx.options.wait,
        })));
    }

    let generation = generation_of(&applied);
    let waiter: Option<Box<dyn Waiter>> = match (workload, generation) {
        (Some(WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::DaemonSet), None) => {
            debug!(what = %target.describe(name), "no metadata.generation; not waiting");
            None
        }
        (Some(kind @ (WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::DaemonSet)), Some(expected_generation)) => Some(Box::new(GenerationWaiter {
            cluster: ctx.cluster.clone(),
            target,
            kind,
            name: name.to_string(),
            description: req.description.to_string(),
            deployable: req.deployable.cloned(),
            previous_generation: applied.pointer("/status/observedGeneration").and_then(Value::as_i64).unwrap_or(0),
            expected_generation,
            config: ctx.options.wait,
        })),
        (Some(WorkloadKind::Pod), _) => Some(Box::new(PodWaiter {
            cluster: ctx.cluster.clone(),
            namespace: ns.to_string(),
            selector: PodSelector::Name(name.to_string()),
            description: req.description.to_string(),
            deployable: req.deployable.cloned(),
            config: ctx.options.wait,
        })),
        (None, _) => None,
    };
    Ok(waiter)
}

pub struct ApplyHandler;

#[async_trait]
impl Handler for ApplyHandler {
    fn kind(&self) -> &'static str { OpApply::KIND }

    fn plan_order(&self, op: &Operation, rules: &PlanOrderRules) -> Result<ScheduleOrder> {
        let spec: OpApply = op.decode()?;
        object_order(spec.resource.as_ref().ok_or_else(|| FerryError::internal("apply.Body is required"))?, rules)
    }

    async fn handle(&self, ctx: &ExecContext, op: &Operation, _inputs: &Inputs) -> Result<HandlerResult> {
        let spec: OpApply = op.decode()?;
        let obj = spec.resource.as_ref().ok_or_else(|| FerryError::internal("apply.Body is required"))?;
        let req = ApplyRequest {
            description: &op.description,
            object: obj,
            inhibit_events: spec.inhibit_events,
            generation_condition: spec.check_generation_condition.as_ref(),
            deployable: spec.deployable.as_ref(),
        };
        Ok(HandlerResult::waiting(apply_object(ctx, req).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecOptions;
    use ferry_kubehub::fake::FakeCluster;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn ctx_for(fake: Arc<FakeCluster>) -> (ExecContext, mpsc::Receiver<ferry_core::Event>) {
        let (tx, rx) = mpsc::channel(16);
        (ExecContext::new(fake, ExecOptions::default(), tx, CancellationToken::new()), rx)
    }

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "shop"},
            "spec": {"replicas": 1, "template": {"spec": {"serviceAccountName": "api", "containers": [{"name": "main", "image": "reg/api"}]}}}
        })
    }

    #[tokio::test]
    async fn config_map_has_no_waiter() {
        let fake = Arc::new(FakeCluster::new());
        let (ctx, _rx) = ctx_for(fake.clone());
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "shop"}, "data": {"a": "b"}});
        let waiter = apply_object(&ctx, ApplyRequest::new("cm", &cm)).await.unwrap();
        assert!(waiter.is_none());
        assert!(fake.object(&Gvk::new("", "v1", "ConfigMap"), Some("shop"), "c").is_some());
    }

    #[tokio::test]
    async fn deployments_commit_and_return_a_generation_waiter() {
        let fake = Arc::new(FakeCluster::new());
        let (ctx, mut rx) = ctx_for(fake.clone());
        let obj = deployment();
        let waiter = apply_object(&ctx, ApplyRequest::new("Server Deployment api", &obj)).await.unwrap().unwrap();
        assert_eq!(waiter.describe(), "Deployment shop/api");
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.stage, Stage::Committed);
        assert_eq!(ev.resource_id, "shop/api");
    }

    #[tokio::test]
    async fn workloads_without_a_generation_are_not_awaited() {
        let mut mock = ferry_kubehub::MockClusterApi::new();
        mock.expect_resolve().returning(|g| Ok(ferry_kubehub::ResourceType::new(g.clone(), "deployments", true)));
        mock.expect_apply().times(1).returning(|_, _, o, _| Ok(o.clone()));
        let (tx, _rx) = mpsc::channel(16);
        let ctx = ExecContext::new(Arc::new(mock), ExecOptions::default(), tx, CancellationToken::new());
        let obj = deployment();
        let waiter = apply_object(&ctx, ApplyRequest::new("Server Deployment api", &obj)).await.unwrap();
        assert!(waiter.is_none());
    }

    #[tokio::test]
    async fn inhibited_events_are_not_sent() {
        let fake = Arc::new(FakeCluster::new());
        let (ctx, mut rx) = ctx_for(fake.clone());
        let obj = deployment();
        let req = ApplyRequest { inhibit_events: true, ..ApplyRequest::new("x", &obj) };
        apply_object(&ctx, req).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn generation_condition_requires_a_generation() {
        let mut mock = ferry_kubehub::MockClusterApi::new();
        mock.expect_resolve().returning(|g| Ok(ferry_kubehub::ResourceType::new(g.clone(), "widgets", true)));
        mock.expect_apply().returning(|_, _, o, _| Ok(o.clone()));
        let (tx, _rx) = mpsc::channel(16);
        let ctx = ExecContext::new(Arc::new(mock), ExecOptions::default(), tx, CancellationToken::new());
        let cond = GenerationCondition { condition_type: "Ready".into() };
        let obj = json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "shop"}});
        let req = ApplyRequest { generation_condition: Some(&cond), ..ApplyRequest::new("Widget w", &obj) };
        let err = apply_object(&ctx, req).await.err().unwrap();
        assert!(matches!(err, FerryError::Internal(ref m) if m.contains("no metadata.generation")));

        let fake = Arc::new(FakeCluster::new());
        let (ctx, _rx) = ctx_for(fake);
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "shop"}});
        let req = ApplyRequest { generation_condition: Some(&cond), ..ApplyRequest::new("cm", &cm) };
        let waiter = apply_object(&ctx, req).await.unwrap().unwrap();
        assert_eq!(waiter.describe(), "ConfigMap shop/c");
    }

    #[tokio::test]
    async fn missing_body_is_internal() {
        let fake = Arc::new(FakeCluster::new());
        let (ctx, _rx) = ctx_for(fake);
        let op = Operation::new("empty", &OpApply::default()).unwrap();
        let err = ApplyHandler.handle(&ctx, &op, &Inputs::new()).await.unwrap_err();
        assert!(matches!(err, FerryError::Internal(ref m) if m.contains("apply.Body is required")));
    }
}
