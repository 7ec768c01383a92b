#![forbid(unsafe_code)]

//! Compiles deployables into ordered cluster operations.

pub mod env;
pub mod extensions;
pub mod probes;
pub mod secrets;
pub mod security;
pub mod services;
pub mod volumes;
pub mod workload;

use ferry_core::naming::{base_annotations, env_labels};
use ferry_core::{Deployable, DeploymentPlan, DeploymentTarget, FerryError, OpApply, OpCleanupRuntimeConfig, Operation, Result, WorkloadKind};
use serde_json::json;
use tracing::info;

pub use workload::prepare_deployment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerOptions {
    /// Servers in testing environments run as bare pods.
    pub deploy_as_pods_in_tests: bool,
}

impl Default for PlannerOptions {
    fn default() -> Self { Self { deploy_as_pods_in_tests: true } }
}

impl PlannerOptions {
    /// `FERRY_DEPLOY_AS_PODS_IN_TESTS`, default true.
    pub fn from_env() -> Self {
        let d = Self::default();
        let deploy_as_pods_in_tests = std::env::var("FERRY_DEPLOY_AS_PODS_IN_TESTS").ok().and_then(|s| s.parse::<bool>().ok()).unwrap_or(d.deploy_as_pods_in_tests);
        Self { deploy_as_pods_in_tests }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Planner {
    pub options: PlannerOptions,
}

impl Planner {
    pub fn new(options: PlannerOptions) -> Self { Self { options } }

    /// One plan for a set of deployables landing in the same namespace.
    pub fn plan_deployment(&self, target: &DeploymentTarget, deployables: &[Deployable]) -> Result<DeploymentPlan> {
        if target.namespace.is_empty() {
            return Err(FerryError::bad_input("deployment target has no namespace"));
        }
        let mut plan = DeploymentPlan { namespace_reference: target.namespace.clone(), ..Default::default() };
        let ns = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": target.namespace, "labels": env_labels(&target.env), "annotations": base_annotations()},
        });
        plan.operations.push(Operation::new("Namespace", &OpApply { resource: Some(ns), ..Default::default() })?);

        let mut runs_pods = false;
        for d in deployables {
            let ops = prepare_deployment(&self.options, target, d).map_err(|e| e.context(&d.name))?;
            plan.operations.extend(ops.into_iter().map(|op| op.with_scope(&d.package_name)));
            runs_pods |= workload::workload_kind(&self.options, target, d.class) == WorkloadKind::Pod;
        }
        if !deployables.is_empty() && !target.env.ephemeral {
            let cleanup = OpCleanupRuntimeConfig { namespace: target.namespace.clone(), check_pods: runs_pods };
            plan.operations.push(Operation::new("cleanup unused resources", &cleanup)?);
        }
        plan.hints.push(format!("Inspect your deployment with `kubectl -n {} get pods`.", target.namespace));
        info!(namespace = %target.namespace, deployables = deployables.len(), ops = plan.operations.len(), "planned deployment");
        Ok(plan)
    }
}
