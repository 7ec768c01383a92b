//! Plan compilation and execution.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use ferry_apply::{ExecContext, Inputs, Registry};
use ferry_core::{topo_sort, DeploymentPlan, FerryError, Operation, PlanOrderRules, Result, ScheduleOrder, ENGINE_VERSION};
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A plan with every operation's effective order and the order to run them in.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub plan: DeploymentPlan,
    pub orders: Vec<ScheduleOrder>,
    pub sorted: Vec<usize>,
}

impl CompiledPlan {
    pub fn ordered(&self) -> impl Iterator<Item = &Operation> + '_ { self.sorted.iter().map(|&i| &self.plan.operations[i]) }
}

/// Resolve handler orders, gate on engine version and sort.
pub fn compile(registry: &Registry, rules: &PlanOrderRules, plan: DeploymentPlan) -> Result<CompiledPlan> {
    let mut orders = Vec::with_capacity(plan.operations.len());
    for op in &plan.operations {
        if op.minimum_version > ENGINE_VERSION {
            return Err(FerryError::internal(format!("{}: requires engine version {} (got {})", op.kind, op.minimum_version, ENGINE_VERSION)));
        }
        let mut order = registry.compute_order(op, rules)?;
        for key in &op.required_outputs {
            order = order.after(key.clone());
        }
        orders.push(order);
    }
    let sorted = topo_sort(&orders)?;
    debug!(ops = sorted.len(), "plan compiled");
    Ok(CompiledPlan { plan, orders, sorted })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    pub operations: usize,
    pub waiters: usize,
}

/// Run handlers one at a time in schedule order, then wait for every
/// convergence waiter they returned. The first failure cancels the rest.
pub async fn execute(registry: &Registry, ctx: &ExecContext, compiled: &CompiledPlan) -> Result<ExecSummary> {
    let t0 = Instant::now();
    let wait_cancel = ctx.cancel.child_token();
    let mut waiters = JoinSet::new();
    let mut outputs: Inputs = BTreeMap::new();
    let mut consumed = BTreeSet::new();
    let mut summary = ExecSummary::default();

    let run = async {
        for op in compiled.ordered() {
            if ctx.cancel.is_cancelled() {
                return Err(FerryError::Cancelled);
            }
            let mut inputs = Inputs::new();
            for key in &op.required_outputs {
                let v = outputs.get(key).ok_or_else(|| FerryError::internal(format!("{}: required input {:?} was not produced", op.description, key)))?;
                inputs.insert(key.clone(), v.clone());
                consumed.insert(key.clone());
            }
            debug!(op = %op.description, kind = %op.kind, "executing");
            let res = registry.get(&op.kind)?.handle(ctx, op, &inputs).await?;
            for (key, v) in res.outputs {
                if outputs.contains_key(&key) {
                    return Err(FerryError::internal(format!("{}: output {:?} was already produced", op.description, key)));
                }
                outputs.insert(key, v);
            }
            if let Some(w) = res.waiter {
                let (events, cancel) = (ctx.events.clone(), wait_cancel.clone());
                waiters.spawn(async move { w.wait(events, cancel).await });
                summary.waiters += 1;
            }
            summary.operations += 1;
            counter!("ops_executed", 1u64);
        }
        if let Some(unused) = outputs.keys().find(|k| !consumed.contains(*k)) {
            return Err(FerryError::internal(format!("output {:?} was produced but never consumed", unused)));
        }
        Ok(())
    };
    let mut first_err = run.await.err();
    if first_err.is_some() {
        wait_cancel.cancel();
    }

    while let Some(joined) = waiters.join_next().await {
        let res = joined.map_err(|e| FerryError::internal(format!("waiter task failed: {}", e))).and_then(|r| r);
        if let Err(e) = res {
            if first_err.is_none() {
                warn!(error = %e, "waiter failed; cancelling the rest");
                wait_cancel.cancel();
                first_err = Some(e);
            }
        }
    }
    histogram!("plan_execute_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match first_err {
        Some(e) => Err(e),
        None => {
            info!(ops = summary.operations, waiters = summary.waiters, took_ms = %t0.elapsed().as_millis(), "plan executed");
            Ok(summary)
        }
    }
}
