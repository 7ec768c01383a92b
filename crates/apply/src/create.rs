use async_trait::async_trait;
use ferry_core::{FerryError, Gvk, OpCreate, OpSpec, Operation, PlanOrderRules, Result, ScheduleOrder};
use ferry_kubehub::Target;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use crate::apply::object_order;
use crate::resolve::resolve_with_retry;
use crate::{ExecContext, Handler, HandlerResult, Inputs};

/// Create-if-absent, so generated values survive re-runs.
pub struct CreateHandler;

fn body(spec: &OpCreate) -> Result<&Value> { spec.resource.as_ref().ok_or_else(|| FerryError::internal("create.Body is required")) }

#[async_trait]
impl Handler for CreateHandler {
    fn kind(&self) -> &'static str { OpCreate::KIND }

    fn plan_order(&self, op: &Operation, rules: &PlanOrderRules) -> Result<ScheduleOrder> { object_order(body(&op.decode()?)?, rules) }

    async fn handle(&self, ctx: &ExecContext, op: &Operation, _inputs: &Inputs) -> Result<HandlerResult> {
        let spec: OpCreate = op.decode()?;
        let obj = body(&spec)?;
        let gvk = Gvk::of(obj)?;
        let ns = obj.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or_default();
        let rt = resolve_with_retry(ctx.cluster.as_ref(), &gvk, &ctx.options.wait, &ctx.cancel).await.map_err(|e| e.context(&op.description))?;
        let target = Target::new(rt, ns);
        counter!("apply_attempts", 1u64);
        match ctx.cluster.create(&target, obj).await {
            Ok(_) => {
                counter!("apply_ok", 1u64);
                info!(what = %op.description, "created");
            }
            Err(FerryError::AlreadyExists(what)) if spec.skip_if_already_exists => debug!(%what, "already exists; keeping it"),
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(e.context(&op.description));
            }
        }
        Ok(HandlerResult::done())
    }
}
