use std::sync::Arc;
use std::time::Duration;

use ferry_api::{FerryApi, InProcApi};
use ferry_apply::ExecOptions;
use ferry_core::naming::ANN_RUNTIME_CONFIG;
use ferry_core::{Deployable, DeploymentTarget, Environment, FerryError, Gvk, Purpose, Ready, Stage};
use ferry_kubehub::fake::FakeCluster;
use ferry_ops::WaitConfig;
use ferry_planner::PlannerOptions;
use serde_json::json;

const API: &str = r#"
name: api
id: x1
package_name: acme/api
main_container:
  image: { repository: "reg/api", tag: "v1" }
  env:
    - { name: CONFIG, source: runtime_config }
runtime_config: { stack_entry: [] }
mount_runtime_config_path: /ferry/config
endpoints:
  - service_name: web
    port: { name: http, container_port: 8080 }
"#;

fn production() -> DeploymentTarget {
    DeploymentTarget { namespace: "shop".into(), env: Environment { name: "prod".into(), purpose: Purpose::Production, ephemeral: false } }
}

fn api(fake: &Arc<FakeCluster>) -> InProcApi {
    let options = ExecOptions { wait: WaitConfig { interval: Duration::from_millis(10), timeout: Duration::from_secs(5) }, ..Default::default() };
    InProcApi::new(fake.clone(), PlannerOptions::default(), options)
}

fn deployment() -> Gvk { Gvk::new("apps", "v1", "Deployment") }

#[tokio::test]
async fn executes_plan_until_the_deployment_converges() {
    let fake = Arc::new(FakeCluster::new());
    fake.put(json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": "default", "namespace": "shop"}})).unwrap();
    let api = api(&fake);
    let d: Deployable = serde_yaml_from(API);
    let plan = api.plan(&production(), &[d]).unwrap();

    let f2 = fake.clone();
    let converge = tokio::spawn(async move {
        while f2.object(&deployment(), Some("shop"), "api-x1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f2.set_status(&deployment(), Some("shop"), "api-x1", json!({"observedGeneration": 1, "replicas": 1, "readyReplicas": 1, "updatedReplicas": 1}))
            .unwrap();
    });

    let mut handle = api.execute(plan).await.unwrap();
    let mut events = Vec::new();
    while let Some(ev) = handle.rx.recv().await {
        events.push(ev);
    }
    let summary = handle.join().await.unwrap();
    converge.await.unwrap();

    assert_eq!(summary.waiters, 1);
    assert!(events.iter().any(|e| e.stage == Stage::Committed));
    let last = events.iter().rev().find(|e| e.resource_id == "shop/api-x1").unwrap();
    assert_eq!((last.stage, last.ready), (Stage::Done, Ready::Ready));

    let obj = fake.object(&deployment(), Some("shop"), "api-x1").unwrap();
    let config_id = obj["metadata"]["annotations"][ANN_RUNTIME_CONFIG].as_str().unwrap();
    assert!(config_id.starts_with("api-x1-") && config_id.ends_with("-runtimecfg"));
    assert!(fake.object(&Gvk::new("", "v1", "ConfigMap"), Some("shop"), config_id).is_some());
    assert!(fake.object(&Gvk::new("", "v1", "Service"), Some("shop"), "web").is_some());
    let env = &obj["spec"]["template"]["spec"]["containers"][0]["env"];
    assert_eq!(env[0]["name"], "CONFIG");
}

#[tokio::test]
async fn cancelling_stops_pending_waiters() {
    let fake = Arc::new(FakeCluster::new());
    fake.put(json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": "default", "namespace": "shop"}})).unwrap();
    let api = api(&fake);
    let plan = api.plan(&production(), &[serde_yaml_from(API)]).unwrap();
    let handle = api.execute(plan).await.unwrap();
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, FerryError::Cancelled), "{err:?}");
}

fn serde_yaml_from(s: &str) -> Deployable { serde_yaml::from_str(s).unwrap() }
