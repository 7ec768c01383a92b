//! Ferry apply: one handler per operation kind, executed against a [`ClusterApi`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use ferry_core::{naming, Event, FerryError, Operation, PlanOrderRules, Result, ScheduleOrder};
use ferry_kubehub::SharedCluster;
use ferry_ops::{WaitConfig, Waiter};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod apply;
mod cleanup;
mod create;
mod deployment;
pub mod resolve;
pub mod runtime_config;

pub use apply::{apply_object, ApplyHandler, ApplyRequest};
pub use cleanup::CleanupRuntimeConfigHandler;
pub use create::CreateHandler;
pub use deployment::{set_container_field, EnsureDeploymentHandler};
pub use runtime_config::{runtime_config_id, EnsureRuntimeConfigHandler};

/// Executor knobs, read once at start-up.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub field_manager: String,
    pub wait: WaitConfig,
    pub order_rules: PlanOrderRules,
}

impl Default for ExecOptions {
    fn default() -> Self { Self { field_manager: naming::FIELD_MANAGER.to_string(), wait: WaitConfig::default(), order_rules: PlanOrderRules::default() } }
}

impl ExecOptions {
    /// `FERRY_FIELD_MANAGER` plus the waiter knobs of [`WaitConfig::from_env`].
    pub fn from_env() -> Self {
        let field_manager = std::env::var("FERRY_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| naming::FIELD_MANAGER.to_string());
        Self { field_manager, wait: WaitConfig::from_env(), ..Default::default() }
    }
}

/// Named outputs published by earlier operations, keyed by output name.
pub type Inputs = BTreeMap<String, Value>;

/// Everything a handler may touch while executing one operation.
pub struct ExecContext {
    pub cluster: SharedCluster,
    pub options: ExecOptions,
    pub events: mpsc::Sender<Event>,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(cluster: SharedCluster, options: ExecOptions, events: mpsc::Sender<Event>, cancel: CancellationToken) -> Self {
        Self { cluster, options, events, cancel }
    }

    pub(crate) async fn emit(&self, ev: Event) {
        let _ = self.events.send(ev).await;
    }
}

/// What a handler hands back: outputs for later operations and an optional
/// continuation that tracks convergence.
#[derive(Default)]
pub struct HandlerResult {
    pub outputs: Vec<(String, Value)>,
    pub waiter: Option<Box<dyn Waiter>>,
}

impl HandlerResult {
    pub fn done() -> Self { Self::default() }

    pub fn waiting(waiter: Option<Box<dyn Waiter>>) -> Self { Self { outputs: Vec::new(), waiter } }
}

impl std::fmt::Debug for HandlerResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerResult")
            .field("outputs", &self.outputs)
            .field("waiter", &self.waiter.as_ref().map(|w| w.describe()))
            .finish()
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Order derived from the payload. Merged with the operation's explicit order.
    fn plan_order(&self, op: &Operation, rules: &PlanOrderRules) -> Result<ScheduleOrder>;

    async fn handle(&self, ctx: &ExecContext, op: &Operation, inputs: &Inputs) -> Result<HandlerResult>;
}

/// Kind -> handler table, built at start-up and passed to the executor.
#[derive(Default)]
pub struct Registry {
    handlers: BTreeMap<&'static str, Box<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Every handler this crate provides.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(ApplyHandler);
        r.register(EnsureDeploymentHandler);
        r.register(EnsureRuntimeConfigHandler);
        r.register(CreateHandler);
        r.register(CleanupRuntimeConfigHandler);
        r
    }

    pub fn register(&mut self, h: impl Handler + 'static) { self.handlers.insert(h.kind(), Box::new(h)); }

    pub fn get(&self, kind: &str) -> Result<&dyn Handler> {
        self.handlers.get(kind).map(|h| h.as_ref()).ok_or_else(|| FerryError::internal(format!("{}: no handler registered", kind)))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ { self.handlers.keys().copied() }

    /// The handler's order merged with the explicit one.
    pub fn compute_order(&self, op: &Operation, rules: &PlanOrderRules) -> Result<ScheduleOrder> {
        let mut order = self.get(&op.kind)?.plan_order(op, rules).map_err(|e| e.context(&op.description))?;
        if let Some(explicit) = &op.order {
            order.merge(explicit);
        }
        Ok(order)
    }
}
