//! Schedule categories and the partial order between operations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{FerryError, Gvk, Result};

/// Categories an operation belongs to, and categories it must be applied after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleOrder {
    pub sched_category: BTreeSet<String>,
    pub sched_after_category: BTreeSet<String>,
}

impl ScheduleOrder {
    pub fn belongs_to(mut self, cat: impl Into<String>) -> Self { self.sched_category.insert(cat.into()); self }

    pub fn after(mut self, cat: impl Into<String>) -> Self { self.sched_after_category.insert(cat.into()); self }

    pub fn merge(&mut self, other: &ScheduleOrder) {
        self.sched_category.extend(other.sched_category.iter().cloned());
        self.sched_after_category.extend(other.sched_after_category.iter().cloned());
    }
}

pub fn sched_category(group: &str, kind: &str) -> String { format!("kube:gv:{}:{}", group, kind) }

pub fn namespace_category(ns: &str) -> String { format!("namespace:{}", ns) }

pub fn deployable_category(id: &str) -> String { format!("deployable:{}", id) }

pub fn owned_by_deployable(id: &str) -> String { format!("owned-by:{}", id) }

pub fn services_category(id: &str) -> String { format!("services:{}", id) }

const KNOWN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "apiextensions.k8s.io",
    "policy",
    "storage.k8s.io",
    "scheduling.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "admissionregistration.k8s.io",
    "autoscaling",
    "certificates.k8s.io",
];

/// Tunables for [`plan_order_with`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOrderRules {
    /// What kinds from unrecognized API groups are applied after.
    pub unknown_group_after: Vec<String>,
}

impl Default for PlanOrderRules {
    fn default() -> Self {
        Self {
            unknown_group_after: vec![
                sched_category("batch", "Job"),
                sched_category("batch", "CronJob"),
                sched_category("apiextensions.k8s.io", "CustomResourceDefinition"),
            ],
        }
    }
}

fn resource_like() -> [String; 3] {
    [sched_category("", "ConfigMap"), sched_category("", "Secret"), sched_category("", "PersistentVolumeClaim")]
}

pub fn plan_order(gvk: &Gvk, namespace: &str, name: &str) -> ScheduleOrder {
    plan_order_with(&PlanOrderRules::default(), gvk, namespace, name)
}

/// Total over every (group, version, kind): never fails.
pub fn plan_order_with(rules: &PlanOrderRules, gvk: &Gvk, namespace: &str, name: &str) -> ScheduleOrder {
    let mut order = ScheduleOrder::default().belongs_to(sched_category(&gvk.group, &gvk.kind));

    if gvk.is("", "Namespace") {
        order = order.belongs_to(namespace_category(name));
    } else if !namespace.is_empty() {
        order = order.after(namespace_category(namespace));
    }

    match (gvk.group.as_str(), gvk.kind.as_str()) {
        ("", "Pod") | ("batch", _) => {
            order.sched_after_category.insert(sched_category("", "ServiceAccount"));
            order.sched_after_category.extend(resource_like());
        }
        ("apps", _) => order.sched_after_category.extend(resource_like()),
        ("networking.k8s.io", _) => {
            order.sched_after_category.insert(sched_category("", "Service"));
            order.sched_after_category.insert(sched_category("", "Secret"));
        }
        (g, _) if KNOWN_GROUPS.contains(&g) => {}
        _ => order.sched_after_category.extend(rules.unknown_group_after.iter().cloned()),
    }

    order
}

/// Order `orders` so that every node comes after all nodes belonging to its
/// after-categories. Returns indices into `orders`; ties keep input order.
pub fn topo_sort(orders: &[ScheduleOrder]) -> Result<Vec<usize>> {
    // Graph nodes: one per operation, one per category. A category completes when
    // all of its members do.
    let n = orders.len();
    let mut cat_ids: BTreeMap<&str, usize> = BTreeMap::new();
    for o in orders {
        for c in o.sched_category.iter().chain(o.sched_after_category.iter()) {
            let next = n + cat_ids.len();
            cat_ids.entry(c.as_str()).or_insert(next);
        }
    }
    let total = n + cat_ids.len();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); total];
    let mut indegree = vec![0usize; total];
    for (i, o) in orders.iter().enumerate() {
        for c in &o.sched_category {
            edges[i].push(cat_ids[c.as_str()]);
            indegree[cat_ids[c.as_str()]] += 1;
        }
        for c in &o.sched_after_category {
            edges[cat_ids[c.as_str()]].push(i);
            indegree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..total).filter(|&k| indegree[k] == 0).collect();
    let mut out = Vec::with_capacity(n);
    let mut visited = 0usize;
    while let Some(k) = ready.pop_first() {
        visited += 1;
        if k < n { out.push(k); }
        for &next in &edges[k] {
            indegree[next] -= 1;
            if indegree[next] == 0 { ready.insert(next); }
        }
    }

    if visited != total {
        return Err(FerryError::internal("ops dependencies are not solvable"));
    }
    Ok(out)
}
