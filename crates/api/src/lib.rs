//! Ferry public API façade (in-process).
//!
//! Frontends plan deployables and execute plans through [`FerryApi`]; the
//! in-process implementation drives the planner and executor directly.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use ferry_apply::{ExecContext, ExecOptions, Registry};
use ferry_core::{Deployable, DeploymentPlan, DeploymentTarget, Event, FerryError, Result};
use ferry_kubehub::{KubeCluster, SharedCluster};
use ferry_planner::{Planner, PlannerOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod exec;

pub use exec::{compile, execute, CompiledPlan, ExecSummary};

/// Declarative Ferry API surface.
#[async_trait]
pub trait FerryApi: Send + Sync {
    /// Compile deployables into a plan; nothing touches the cluster.
    fn plan(&self, target: &DeploymentTarget, deployables: &[Deployable]) -> Result<DeploymentPlan>;

    /// Effective order of a plan's operations.
    fn compile(&self, plan: DeploymentPlan) -> Result<CompiledPlan>;

    /// Execute a plan in the background. Events stream until it finishes.
    async fn execute(&self, plan: DeploymentPlan) -> Result<StreamHandle<Event>>;
}

/// In-process implementation that calls internal crates directly.
pub struct InProcApi {
    cluster: SharedCluster,
    registry: Arc<Registry>,
    planner: Planner,
    options: ExecOptions,
    queue_cap: usize,
}

impl InProcApi {
    pub fn new(cluster: SharedCluster, planner: PlannerOptions, options: ExecOptions) -> Self {
        let queue_cap = std::env::var("FERRY_EVENT_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).filter(|&n| n > 0).unwrap_or(256);
        Self { cluster, registry: Arc::new(Registry::with_defaults()), planner: Planner::new(planner), options, queue_cap }
    }

    /// Connect to the current kube context with options read from the environment.
    pub async fn connect() -> anyhow::Result<Self> {
        let cluster = KubeCluster::connect().await?;
        Ok(Self::new(Arc::new(cluster), PlannerOptions::from_env(), ExecOptions::from_env()))
    }
}

#[async_trait]
impl FerryApi for InProcApi {
    fn plan(&self, target: &DeploymentTarget, deployables: &[Deployable]) -> Result<DeploymentPlan> { self.planner.plan_deployment(target, deployables) }

    fn compile(&self, plan: DeploymentPlan) -> Result<CompiledPlan> { compile(&self.registry, &self.options.order_rules, plan) }

    async fn execute(&self, plan: DeploymentPlan) -> Result<StreamHandle<Event>> {
        let compiled = self.compile(plan)?;
        info!(ops = compiled.sorted.len(), namespace = %compiled.plan.namespace_reference, "api: execute start");
        let (tx, rx) = mpsc::channel::<Event>(self.queue_cap);
        let token = CancellationToken::new();
        let ctx = ExecContext::new(self.cluster.clone(), self.options.clone(), tx, token.clone());
        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let res = execute(&registry, &ctx, &compiled).await;
            info!(ok = res.is_ok(), "api: execute finished");
            res
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { token }, task })
    }
}

/// Cancels a running execution; waiters stop at their next poll.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) { self.token.cancel() }
}

/// Event stream of a running execution plus its eventual outcome.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
    task: tokio::task::JoinHandle<Result<ExecSummary>>,
}

impl<T> StreamHandle<T> {
    /// Wait for the execution to finish. Unread events are dropped.
    pub async fn join(self) -> Result<ExecSummary> {
        drop(self.rx);
        self.task.await.map_err(|e| FerryError::internal(format!("execution task failed: {}", e)))?
    }
}
