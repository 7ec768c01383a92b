//! Ferry core: workload descriptors, operations, schedule order and errors.

#![forbid(unsafe_code)]

pub mod deployable;
pub mod error;
pub mod event;
pub mod gvk;
pub mod naming;
pub mod plan;
pub mod runtime;
pub mod sched;

pub use deployable::*;
pub use error::{ContainerFailure, FailedContainer, FerryError, Result};
pub use event::{prepare_event, ContainerWaitStatus, Event, Ready, Stage, WaitStatus};
pub use gvk::{Gvk, WorkloadKind};
pub use plan::{
    runtime_config_output, DeploymentPlan, EnsureRuntimeConfigOutput, GenerationCondition, InjectedResource, OpApply, OpCleanupRuntimeConfig, OpCreate,
    OpEnsureDeployment, OpEnsureRuntimeConfig, OpSpec, Operation,
};
pub use sched::{plan_order, plan_order_with, topo_sort, PlanOrderRules, ScheduleOrder};

/// Version of the engine that executes plans; operations may require a minimum.
pub const ENGINE_VERSION: u32 = 1;
