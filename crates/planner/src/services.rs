//! One Service per exported endpoint.

use std::collections::BTreeMap;

use ferry_core::naming::{make_service_annotations, make_service_labels, select_by_id};
use ferry_core::sched::{deployable_category, owned_by_deployable, services_category};
use ferry_core::{DeployableRef, DeploymentTarget, Endpoint, FerryError, OpApply, Operation, Result, ScheduleOrder};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static RFC1035_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").unwrap());

pub fn validate_service_name(name: &str) -> Result<()> {
    if RFC1035_LABEL.is_match(name) {
        Ok(())
    } else {
        Err(FerryError::bad_input(format!("{:?}: service name must be a lowercase RFC 1035 label", name)))
    }
}

pub fn service_name(e: &Endpoint) -> &str { if e.allocated_name.is_empty() { &e.service_name } else { &e.allocated_name } }

/// Service operations for `endpoints`; endpoints without a port are skipped.
pub fn plan_services(target: &DeploymentTarget, d: &DeployableRef, endpoints: &[Endpoint], extra_annotations: &BTreeMap<String, String>) -> Result<Vec<Operation>> {
    let mut ops = Vec::new();
    for e in endpoints {
        let Some(port) = &e.port else { continue };
        let name = service_name(e);
        validate_service_name(name)?;
        let mut annotations = extra_annotations.clone();
        annotations.extend(make_service_annotations(e, &d.package_name));
        let exported = if e.exported_port > 0 { e.exported_port } else { port.container_port };
        let mut spec = json!({
            "selector": select_by_id(d),
            "ports": [{"name": port_name(&port.name, exported), "protocol": "TCP", "port": exported, "targetPort": port.container_port}],
        });
        if e.load_balancer {
            spec["type"] = Value::from("LoadBalancer");
        }
        let svc = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": target.namespace, "labels": make_service_labels(&target.env, d, e), "annotations": annotations},
            "spec": spec,
        });
        let order = ScheduleOrder::default()
            .belongs_to(owned_by_deployable(&d.id))
            .belongs_to(services_category(&d.id))
            .after(deployable_category(&d.id));
        let desc = format!("Service {}:{}", d.name, e.service_name);
        ops.push(Operation::new(desc, &OpApply { resource: Some(svc), ..Default::default() })?.with_order(order));
    }
    Ok(ops)
}

fn port_name(name: &str, port: i32) -> String {
    if name.is_empty() { format!("p{}", port) } else { name.to_lowercase() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::ContainerPort;

    fn endpoint(name: &str, port: Option<i32>) -> Endpoint {
        Endpoint {
            service_name: name.into(),
            allocated_name: String::new(),
            port: port.map(|p| ContainerPort { name: "http".into(), container_port: p }),
            exported_port: 80,
            load_balancer: false,
            annotations: BTreeMap::from([("x".to_string(), "y".to_string())]),
            grpc_services: vec![],
        }
    }

    fn dep() -> DeployableRef { DeployableRef { name: "api".into(), id: "x1".into(), package_name: "acme/api".into(), ..Default::default() } }

    #[test]
    fn service_ports_and_order() {
        let target = DeploymentTarget { namespace: "shop".into(), ..Default::default() };
        let ops = plan_services(&target, &dep(), &[endpoint("web", Some(8080)), endpoint("metrics", None)], &BTreeMap::new()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].description, "Service api:web");
        let svc = ops[0].resource().unwrap();
        assert_eq!(svc["spec"]["ports"][0], json!({"name": "http", "protocol": "TCP", "port": 80, "targetPort": 8080}));
        assert!(svc["spec"].get("type").is_none());
        assert_eq!(svc["metadata"]["annotations"]["x"], "y");
        let order = ops[0].order.as_ref().unwrap();
        assert!(order.sched_after_category.contains("deployable:x1"));
        assert!(order.sched_category.contains("services:x1"));
    }

    #[test]
    fn names_are_rfc1035_labels() {
        assert!(validate_service_name("web-1").is_ok());
        for bad in ["Web", "1web", "web-", "", "a_b"] {
            assert!(validate_service_name(bad).is_err(), "{bad}");
        }
        let target = DeploymentTarget::default();
        let mut lb = endpoint("Web", Some(80));
        assert!(matches!(plan_services(&target, &dep(), &[lb.clone()], &BTreeMap::new()), Err(FerryError::BadInput(_))));
        lb.allocated_name = "web".into();
        lb.load_balancer = true;
        let ops = plan_services(&target, &dep(), &[lb], &BTreeMap::new()).unwrap();
        assert_eq!(ops[0].resource().unwrap()["spec"]["type"], "LoadBalancer");
    }
}
