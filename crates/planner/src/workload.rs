//! Compiles one deployable into the workload operation and everything it needs.

use std::collections::{BTreeMap, BTreeSet};

use ferry_core::naming::{deployment_id_of, label_like, make_annotations, make_labels, ADMIN_NAMESPACE, ANN_CONFIG_IMAGE};
use ferry_core::sched::{deployable_category, owned_by_deployable, sched_category};
use ferry_core::{
    runtime_config_output, ContainerSpec, Deployable, DeployableClass, DeployableRef, DeploymentTarget, EnvVar, ExtensionPayload, FerryError,
    InjectedResource, OpApply, OpEnsureDeployment, OpEnsureRuntimeConfig, Operation, Probe, Purpose, Result, ScheduleOrder, SetContainerField,
    Toleration, WorkloadKind,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::env::fill_env;
use crate::extensions::{consolidate, merge_envs, Extension, ExtensionMount, PodSecurityOverride};
use crate::probes::container_probes;
use crate::secrets::{managed_secret_name, SecretCollector};
use crate::security::{container_security, PodSecurity};
use crate::services::plan_services;
use crate::volumes::{ObjectMeta, PodVolumes};
use crate::PlannerOptions;

pub const RUNTIME_CONFIG_VOLUME: &str = "ferry-rtconfig";
pub const PROJECTED_SECRETS_VOLUME: &str = "ferry-projected-secrets";
pub const PROJECTED_SECRETS_PATH: &str = "/ferry/secrets";
const REVISION_HISTORY_LIMIT: i32 = 10;
const DEFAULT_CONTAINER_NAME: &str = "server";

/// Everything the deployable's extensions contribute, merged.
#[derive(Debug, Default)]
struct Extensions {
    volumes: Vec<Value>,
    pod_annotations: BTreeMap<String, String>,
    ensure_service_account: bool,
    service_account: Option<String>,
    service_account_annotations: BTreeMap<String, String>,
    security: Vec<PodSecurityOverride>,
    mounts: Vec<ExtensionMount>,
    env: Vec<EnvVar>,
    args: Vec<String>,
    probes: Vec<Probe>,
    init_args: BTreeMap<String, Vec<String>>,
}

impl Extensions {
    fn collect(payloads: &[ExtensionPayload]) -> Result<Self> {
        let mut x = Self::default();
        for p in payloads {
            match Extension::decode(p)? {
                Extension::Spec(s) => {
                    if let Some(sa) = &s.service_account {
                        consolidate(&mut x.service_account, sa, "service accounts")?;
                    }
                    x.volumes.extend(s.volumes);
                    x.pod_annotations.extend(s.annotations);
                    x.ensure_service_account |= s.ensure_service_account;
                    x.service_account_annotations.extend(s.service_account_annotations);
                    x.security.extend(s.security_context);
                }
                Extension::Container(c) => {
                    merge_envs(&mut x.env, &c.env)?;
                    x.mounts.extend(c.volume_mounts);
                    x.args.extend(c.args);
                    x.probes.extend(c.probes);
                }
                Extension::InitContainer(i) => x.init_args.entry(i.package_ref).or_default().extend(i.args),
            }
        }
        Ok(x)
    }

    fn mounts(&self, init: bool) -> impl Iterator<Item = Value> + '_ {
        self.mounts
            .iter()
            .filter(move |m| !init || m.mount_on_init)
            .map(|m| json!({"name": m.name, "mountPath": m.mount_path, "readOnly": m.read_only}))
    }
}

fn render_container(name: &str, c: &ContainerSpec, args: Vec<String>, env: Vec<Value>, mounts: Vec<Value>) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("name".into(), json!(name));
    m.insert("image".into(), json!(c.image.image()));
    if !c.command.is_empty() {
        m.insert("command".into(), json!(c.command));
    }
    if !args.is_empty() {
        m.insert("args".into(), json!(args));
    }
    if let Some(wd) = c.working_dir.as_deref().filter(|s| !s.is_empty()) {
        m.insert("workingDir".into(), json!(wd));
    }
    if !c.ports.is_empty() {
        let ports: Vec<Value> = c
            .ports
            .iter()
            .map(|p| {
                let mut port = json!({"containerPort": p.container_port, "protocol": "TCP"});
                if !p.name.is_empty() {
                    port["name"] = json!(p.name.to_lowercase());
                }
                port
            })
            .collect();
        m.insert("ports".into(), json!(ports));
    }
    if !env.is_empty() {
        m.insert("env".into(), json!(env));
    }
    if !mounts.is_empty() {
        m.insert("volumeMounts".into(), json!(mounts));
    }
    if let Some(sc) = container_security(c) {
        m.insert("securityContext".into(), sc);
    }
    m.insert("terminationMessagePolicy".into(), json!("FallbackToLogsOnError"));
    m
}

fn render_toleration(t: &Toleration) -> Value {
    let mut v = json!({"key": t.key, "effect": t.effect});
    if let Some(op) = &t.operator {
        v["operator"] = json!(op);
    }
    if let Some(val) = &t.value {
        v["value"] = json!(val);
    }
    v
}

/// Identity env handed to sidecars so they can find the server they run next to.
fn sidecar_env(d: &Deployable) -> Vec<EnvVar> {
    vec![
        EnvVar::literal("FERRY_DEPLOYABLE_NAME", &d.name),
        EnvVar::literal("FERRY_DEPLOYABLE_ID", &d.id),
        EnvVar::literal("FERRY_PACKAGE_NAME", &d.package_name),
    ]
}

fn computed_instance<'d>(d: &'d Deployable, id: &str, what: &str) -> Result<&'d Value> {
    d.computed_resources
        .iter()
        .find(|c| c.resource_instance_id == id)
        .map(|c| &c.instance)
        .ok_or_else(|| FerryError::internal(format!("{}: missing computed resource {:?}", what, id)))
}

pub(crate) fn workload_kind(opts: &PlannerOptions, target: &DeploymentTarget, class: DeployableClass) -> WorkloadKind {
    match class {
        _ if opts.deploy_as_pods_in_tests && target.env.purpose == Purpose::Testing => WorkloadKind::Pod,
        DeployableClass::OneShot | DeployableClass::Manual => WorkloadKind::Pod,
        DeployableClass::Stateless => WorkloadKind::Deployment,
        DeployableClass::Stateful => WorkloadKind::StatefulSet,
        DeployableClass::Daemonset => WorkloadKind::DaemonSet,
    }
}

fn workload_description(kind: WorkloadKind, d: &Deployable) -> String {
    if let Some(desc) = d.description.as_deref().filter(|s| !s.is_empty()) {
        return desc.to_string();
    }
    match kind {
        WorkloadKind::Pod if d.class.is_one_shot_like() => format!("One-shot {}", d.name),
        WorkloadKind::Pod => format!("Server {}", d.name),
        WorkloadKind::Deployment => format!("Server Deployment {}", d.name),
        WorkloadKind::StatefulSet => format!("Server StatefulSet {}", d.name),
        WorkloadKind::DaemonSet => format!("Server DaemonSet {}", d.name),
    }
}

/// Operations for one deployable: supporting objects, the optional runtime
/// config, the workload itself and its services.
pub fn prepare_deployment(opts: &PlannerOptions, target: &DeploymentTarget, d: &Deployable) -> Result<Vec<Operation>> {
    if !d.main_container.image.is_resolved() {
        return Err(FerryError::bad_input("missing server image"));
    }
    let r = DeployableRef::from(d);
    let dep_id = deployment_id_of(&r);
    let ns = target.namespace.as_str();
    let labels = make_labels(&target.env, &r);
    let annotations = make_annotations(&target.env, &d.package_name);
    let meta = ObjectMeta { namespace: ns, labels: &labels, annotations: &annotations };

    let ext = Extensions::collect(&d.extensions)?;
    let mut secrets = SecretCollector::new(d.secrets.as_deref(), managed_secret_name(&d.name, &d.id));
    let mut deferred = SetContainerField::default();
    let mut security = PodSecurity::default();
    for o in &ext.security {
        security.add_override(o)?;
    }

    let mut pod_volumes = PodVolumes::materialize(target, &meta, &d.volumes, &mut secrets)?;
    let mut aux = std::mem::take(&mut pod_volumes.ops);
    ext.volumes.iter().cloned().for_each(|v| pod_volumes.push_raw(v));

    // Main container.
    let main_name = if d.main_container.name.is_empty() { DEFAULT_CONTAINER_NAME } else { d.main_container.name.as_str() };
    if let Some(run_as) = &d.main_container.run_as {
        security.add_run_as(run_as)?;
    }
    let mut main_env = d.main_container.env.clone();
    merge_envs(&mut main_env, &ext.env)?;
    let main_env = fill_env(&main_env, main_name, &mut secrets, &mut deferred)?;
    let mut main_mounts = pod_volumes.mounts(&d.main_container.mounts)?;
    main_mounts.extend(ext.mounts(false));
    let mut main_args = d.main_container.args.clone();
    main_args.extend(ext.args.iter().cloned());

    let mut injected = Vec::new();
    if !d.secret_resources.is_empty() {
        let mut sources = Vec::new();
        for sr in &d.secret_resources {
            let alloc = secrets.allocate(&sr.secret_ref)?;
            let path = label_like(&sr.resource_ref);
            sources.push(json!({"secret": {"name": alloc.name, "items": [{"key": alloc.key, "path": path}]}}));
            injected.push(InjectedResource { resource_ref: sr.resource_ref.clone(), instance: json!({"path": format!("{}/{}", PROJECTED_SECRETS_PATH, path)}) });
        }
        pod_volumes.push_raw(json!({"name": PROJECTED_SECRETS_VOLUME, "projected": {"sources": sources}}));
        main_mounts.push(json!({"name": PROJECTED_SECRETS_VOLUME, "mountPath": PROJECTED_SECRETS_PATH, "readOnly": true}));
    }
    for p in &d.planned_resource_deps {
        let instance = computed_instance(d, &p.resource_instance_id, &p.resource_ref)?;
        injected.push(InjectedResource { resource_ref: p.resource_ref.clone(), instance: instance.clone() });
    }

    let mut probes = d.probes.clone();
    probes.extend(ext.probes.iter().cloned());
    let probes = container_probes(target.env.purpose, &probes)?;

    // Sidecars and init containers.
    let mut names = BTreeSet::from([main_name.to_string()]);
    let mut sidecars = Vec::new();
    for s in &d.sidecars {
        let name = format!("sidecar-{}", s.name);
        if !names.insert(name.clone()) {
            return Err(FerryError::bad_input(format!("{}: duplicate container name", name)));
        }
        if let Some(run_as) = &s.run_as {
            security.add_run_as(run_as)?;
        }
        let mut env = s.env.clone();
        merge_envs(&mut env, &sidecar_env(d))?;
        let env = fill_env(&env, &name, &mut secrets, &mut deferred)?;
        let mounts = pod_volumes.mounts(&s.mounts)?;
        sidecars.push(Value::Object(render_container(&name, s, s.args.clone(), env, mounts)));
    }
    let mut inits = Vec::new();
    for i in &d.inits {
        let name = format!("init-{}", i.name);
        if !names.insert(name.clone()) {
            return Err(FerryError::bad_input(format!("{}: duplicate container name", name)));
        }
        let mut args = i.args.clone();
        if let Some(extra) = i.package_ref.as_ref().and_then(|p| ext.init_args.get(p)) {
            args.extend(extra.iter().cloned());
        }
        let env = fill_env(&i.env, &name, &mut secrets, &mut deferred)?;
        let mut mounts = pod_volumes.mounts(&i.mounts)?;
        mounts.extend(ext.mounts(true));
        inits.push(Value::Object(render_container(&name, i, args, env, mounts)));
    }

    // Runtime configuration.
    // Build provenance rides along with other config data and never stands alone.
    let has_config_data = d.runtime_config.is_some() || !d.resource_deps.is_empty() || !injected.is_empty();
    let persist = has_config_data && d.mount_runtime_config_path.as_deref().is_some_and(|p| !p.is_empty());
    let mut set_fields = d.set_container_fields.clone();
    if !deferred.set_env.is_empty() || !deferred.set_arg.is_empty() {
        set_fields.push(deferred);
    }
    let plans_runtime_config = has_config_data || !set_fields.is_empty();
    if let Some(path) = d.mount_runtime_config_path.as_deref().filter(|_| persist) {
        main_mounts.push(json!({"name": RUNTIME_CONFIG_VOLUME, "mountPath": path, "readOnly": true}));
    }

    let mut main = render_container(main_name, &d.main_container, main_args, main_env, main_mounts);
    main.extend(probes);
    let mut containers = vec![Value::Object(main)];
    containers.extend(sidecars);

    // Service account and cluster role bindings.
    let mut service_account = ext.service_account.clone();
    let creates_service_account = ext.ensure_service_account || !d.permissions.cluster_roles.is_empty();
    if creates_service_account {
        let sa_name = service_account.get_or_insert_with(|| dep_id.clone()).clone();
        let mut sa_annotations = annotations.clone();
        sa_annotations.extend(ext.service_account_annotations.clone());
        let sa = json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": sa_name, "namespace": ns, "labels": labels, "annotations": sa_annotations},
        });
        aux.push(Operation::new("Service Account", &OpApply { resource: Some(sa), ..Default::default() })?);
        for role in &d.permissions.cluster_roles {
            let instance = computed_instance(d, &role.resource_id, &role.label)?;
            let role_name = instance
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| FerryError::internal(format!("{}: cluster role instance has no name", role.label)))?;
            let binding = json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": {"name": format!("binding:{}:{}", dep_id, role_name), "labels": labels, "annotations": annotations},
                "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": role_name},
                "subjects": [{"kind": "ServiceAccount", "name": sa_name, "namespace": ns}],
            });
            let op = Operation::new(format!("Cluster role binding {}", role.label), &OpApply { resource: Some(binding), ..Default::default() })?
                .with_order(ScheduleOrder::default().after(sched_category("", "ServiceAccount")));
            aux.push(op);
        }
    }

    // Pod spec.
    let mut pod_spec = json!({"containers": containers, "enableServiceLinks": false});
    if !inits.is_empty() {
        pod_spec["initContainers"] = json!(inits);
    }
    if !pod_volumes.volumes.is_empty() {
        pod_spec["volumes"] = json!(pod_volumes.volumes);
    }
    if let Some(sc) = security.render(target.env.purpose, d.main_container.privileged) {
        pod_spec["securityContext"] = sc;
    }
    if let Some(sa) = &service_account {
        pod_spec["serviceAccountName"] = json!(sa);
    }
    if !d.tolerations.is_empty() {
        pod_spec["tolerations"] = json!(d.tolerations.iter().map(render_toleration).collect::<Vec<_>>());
    }
    if !d.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(d.node_selector);
    }

    let mut pod_annotations = annotations.clone();
    pod_annotations.extend(ext.pod_annotations.clone());
    let mut top_annotations = annotations.clone();
    if let Some(img) = d.config_image.as_ref().filter(|i| i.is_resolved()) {
        top_annotations.insert(ANN_CONFIG_IMAGE.to_string(), img.image());
    }

    let kind = workload_kind(opts, target, d.class);
    let gvk = kind.gvk();
    let object = match kind {
        WorkloadKind::Pod => {
            pod_spec["restartPolicy"] = json!(if d.class.is_one_shot_like() { "Never" } else { "Always" });
            top_annotations.extend(ext.pod_annotations.clone());
            json!({
                "apiVersion": gvk.api_version(),
                "kind": gvk.kind,
                "metadata": {"name": dep_id, "namespace": ns, "labels": labels, "annotations": top_annotations},
                "spec": pod_spec,
            })
        }
        WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => {
            let mut spec = json!({
                "selector": {"matchLabels": ferry_core::naming::select_by_id(&r)},
                "revisionHistoryLimit": REVISION_HISTORY_LIMIT,
                "template": {"metadata": {"labels": labels, "annotations": pod_annotations}, "spec": pod_spec},
            });
            if kind != WorkloadKind::DaemonSet {
                spec["replicas"] = json!(d.replicas.max(1));
            }
            if kind == WorkloadKind::StatefulSet {
                spec["serviceName"] = json!(dep_id);
            }
            json!({
                "apiVersion": gvk.api_version(),
                "kind": gvk.kind,
                "metadata": {"name": dep_id, "namespace": ns, "labels": labels, "annotations": top_annotations},
                "spec": spec,
            })
        }
    };

    let inhibit_events = d.class == DeployableClass::Manual || (ns == ADMIN_NAMESPACE && !d.focused);
    let ensure = OpEnsureDeployment {
        deployable: r.clone(),
        resource: Some(object),
        configuration_volume_name: persist.then(|| RUNTIME_CONFIG_VOLUME.to_string()),
        set_container_fields: set_fields,
        inhibit_events,
        runtime_config_dependency: plans_runtime_config,
    };
    let mut order = ScheduleOrder::default().belongs_to(deployable_category(&d.id)).belongs_to(owned_by_deployable(&d.id));
    if creates_service_account {
        order = order.after(sched_category("", "ServiceAccount"));
    }
    let mut ensure_op = Operation::new(workload_description(kind, d), &ensure)?.with_order(order);

    let mut ops: Vec<Operation> = aux;
    ops.extend(secrets.plan(ns, &labels, &annotations)?);
    let owned = ScheduleOrder::default().belongs_to(owned_by_deployable(&d.id));
    let mut ops: Vec<Operation> = ops.into_iter().map(|op| op.with_order(owned.clone())).collect();
    if plans_runtime_config {
        let rc = OpEnsureRuntimeConfig {
            deployable: r.clone(),
            namespace: ns.to_string(),
            runtime_config: d.runtime_config.clone(),
            resource_deps: d.resource_deps.clone(),
            injected_resources: injected,
            build_vcs: d.build_vcs.clone(),
            persist_configuration: persist,
        };
        ops.push(Operation::new("Runtime configuration", &rc)?);
        ensure_op = ensure_op.requires(runtime_config_output(&r));
    }
    ops.push(ensure_op);
    ops.extend(plan_services(target, &r, &d.endpoints, &annotations)?);
    debug!(deployable = %d.name, kind = ?kind, ops = ops.len(), "prepared deployment");
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{ClusterRoleRef, ComputedResource, Environment, ImageRef, Mount, OpSpec, PlannedDependency, SecretSpec, SecretValue, Volume, VolumeKind};

    fn target(purpose: Purpose, ephemeral: bool) -> DeploymentTarget {
        DeploymentTarget { namespace: "shop".into(), env: Environment { name: "env".into(), purpose, ephemeral } }
    }

    fn base() -> Deployable {
        Deployable {
            name: "api".into(),
            id: "x1".into(),
            package_name: "acme/api".into(),
            main_container: ContainerSpec { image: ImageRef { repository: "reg/api".into(), tag: Some("v1".into()), digest: None }, ..Default::default() },
            ..Default::default()
        }
    }

    fn opts() -> PlannerOptions { PlannerOptions { deploy_as_pods_in_tests: true } }

    fn ensure_of(ops: &[Operation]) -> OpEnsureDeployment {
        ops.iter().find(|o| o.kind == OpEnsureDeployment::KIND).unwrap().decode().unwrap()
    }

    #[test]
    fn unresolved_image_is_bad_input() {
        let mut d = base();
        d.main_container.image = ImageRef::default();
        assert!(matches!(prepare_deployment(&opts(), &target(Purpose::Production, false), &d), Err(FerryError::BadInput(_))));
    }

    #[test]
    fn tests_deploy_as_pods_and_one_shots_never_restart() {
        let ops = prepare_deployment(&opts(), &target(Purpose::Testing, true), &base()).unwrap();
        let pod = ensure_of(&ops).resource.unwrap();
        assert_eq!(pod["kind"], "Pod");
        assert_eq!(pod["spec"]["restartPolicy"], "Always");
        assert_eq!(ops.last().unwrap().description, "Server api");

        let mut job = base();
        job.class = DeployableClass::OneShot;
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &job).unwrap();
        let pod = ensure_of(&ops).resource.unwrap();
        assert_eq!(pod["spec"]["restartPolicy"], "Never");
        assert_eq!(pod["spec"]["containers"][0]["terminationMessagePolicy"], "FallbackToLogsOnError");
    }

    #[test]
    fn stateful_and_daemonset_shapes() {
        let mut d = base();
        d.class = DeployableClass::Stateful;
        d.replicas = 3;
        let sts = ensure_of(&prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap()).resource.unwrap();
        assert_eq!(sts["kind"], "StatefulSet");
        assert_eq!(sts["spec"]["replicas"], 3);
        assert_eq!(sts["spec"]["serviceName"], "api-x1");

        d.class = DeployableClass::Daemonset;
        let ds = ensure_of(&prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap()).resource.unwrap();
        assert_eq!(ds["kind"], "DaemonSet");
        assert!(ds["spec"].get("replicas").is_none());
        assert_eq!(ds["spec"]["template"]["spec"]["enableServiceLinks"], false);
    }

    #[test]
    fn runtime_config_mount_and_requirement() {
        let mut d = base();
        d.runtime_config = Some(json!({"stack_entry": []}));
        d.mount_runtime_config_path = Some("/ferry/config".into());
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap();
        let rc: OpEnsureRuntimeConfig = ops.iter().find(|o| o.kind == OpEnsureRuntimeConfig::KIND).unwrap().decode().unwrap();
        assert!(rc.persist_configuration);
        let ensure_op = ops.iter().find(|o| o.kind == OpEnsureDeployment::KIND).unwrap();
        assert_eq!(ensure_op.required_outputs, vec!["runtime-config:x1".to_string()]);
        let ensure = ensure_of(&ops);
        assert_eq!(ensure.configuration_volume_name.as_deref(), Some(RUNTIME_CONFIG_VOLUME));
        let mounts = &ensure.resource.unwrap()["spec"]["template"]["spec"]["containers"][0]["volumeMounts"];
        assert_eq!(mounts[0], json!({"name": RUNTIME_CONFIG_VOLUME, "mountPath": "/ferry/config", "readOnly": true}));

    }

    #[test]
    fn runtime_config_is_planned_without_a_mount() {
        let mut d = base();
        d.runtime_config = Some(json!({"stack_entry": []}));
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap();
        let rcs: Vec<_> = ops.iter().filter(|o| o.kind == OpEnsureRuntimeConfig::KIND).collect();
        assert_eq!(rcs.len(), 1);
        let rc: OpEnsureRuntimeConfig = rcs[0].decode().unwrap();
        assert!(!rc.persist_configuration);
        let ensure_op = ops.iter().find(|o| o.kind == OpEnsureDeployment::KIND).unwrap();
        assert_eq!(ensure_op.required_outputs, vec!["runtime-config:x1".to_string()]);
        let ensure = ensure_of(&ops);
        assert!(ensure.runtime_config_dependency && ensure.needs_runtime_config());
        assert!(ensure.configuration_volume_name.is_none());
        assert!(ensure.resource.unwrap()["spec"]["template"]["spec"]["containers"][0].get("volumeMounts").is_none());
    }

    #[test]
    fn build_provenance_alone_plans_no_runtime_config() {
        let mut d = base();
        d.build_vcs = Some(json!({"revision": "abc123"}));
        d.mount_runtime_config_path = Some("/ferry/config".into());
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap();
        assert!(ops.iter().all(|o| o.kind != OpEnsureRuntimeConfig::KIND));
        let ensure_op = ops.iter().find(|o| o.kind == OpEnsureDeployment::KIND).unwrap();
        assert!(ensure_op.required_outputs.is_empty());
        let ensure = ensure_of(&ops);
        assert!(!ensure.needs_runtime_config());
        assert!(ensure.resource.unwrap()["spec"]["template"]["spec"]["containers"][0].get("volumeMounts").is_none());
    }

    #[test]
    fn pod_security_defaults_follow_the_environment() {
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &base()).unwrap();
        let sc = &ensure_of(&ops).resource.unwrap()["spec"]["template"]["spec"]["securityContext"];
        assert_eq!(sc["seccompProfile"]["type"], "RuntimeDefault");
        assert_eq!(sc["fsGroupChangePolicy"], "OnRootMismatch");

        let mut d = base();
        d.main_container.privileged = true;
        let ops = prepare_deployment(&opts(), &target(Purpose::Development, false), &d).unwrap();
        let spec = &ensure_of(&ops).resource.unwrap()["spec"]["template"]["spec"];
        assert_eq!(spec["securityContext"]["runAsUser"], 0);
        assert_eq!(spec["securityContext"]["runAsGroup"], 0);
        assert!(spec["securityContext"].get("fsGroupChangePolicy").is_none());
        assert_eq!(spec["containers"][0]["securityContext"]["privileged"], true);
    }

    #[test]
    fn cluster_roles_create_service_account_and_bindings() {
        let mut d = base();
        d.permissions.cluster_roles = vec![ClusterRoleRef { label: "reader".into(), resource_id: "r1".into() }];
        d.computed_resources = vec![ComputedResource { resource_instance_id: "r1".into(), instance_type: "role".into(), instance: json!({"name": "view"}) }];
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap();
        assert_eq!(ops[0].description, "Service Account");
        let crb = ops[1].resource().unwrap();
        assert_eq!(crb["metadata"]["name"], "binding:api-x1:view");
        assert_eq!(crb["subjects"][0]["name"], "api-x1");
        let ensure_op = ops.iter().find(|o| o.kind == OpEnsureDeployment::KIND).unwrap();
        assert!(ensure_op.order.as_ref().unwrap().sched_after_category.contains("kube:gv::ServiceAccount"));
        assert_eq!(ensure_of(&ops).resource.unwrap()["spec"]["template"]["spec"]["serviceAccountName"], "api-x1");

        d.computed_resources.clear();
        assert!(matches!(prepare_deployment(&opts(), &target(Purpose::Production, false), &d), Err(FerryError::Internal(_))));
    }

    #[test]
    fn extensions_feed_the_pod() {
        let mut d = base();
        d.extensions = vec![
            ExtensionPayload { kind: "spec".into(), payload: json!({"volumes": [{"name": "ext", "emptyDir": {}}], "annotations": {"a": "b"}, "service_account": "runner"}) },
            ExtensionPayload { kind: "container".into(), payload: json!({"args": ["--ext"], "volume_mounts": [{"name": "ext", "mount_path": "/ext"}]}) },
        ];
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap();
        let obj = ensure_of(&ops).resource.unwrap();
        let spec = &obj["spec"]["template"]["spec"];
        assert_eq!(spec["serviceAccountName"], "runner");
        assert_eq!(spec["volumes"][0]["name"], "ext");
        assert_eq!(spec["containers"][0]["args"], json!(["--ext"]));
        assert_eq!(spec["containers"][0]["volumeMounts"][0]["mountPath"], "/ext");
        assert_eq!(obj["spec"]["template"]["metadata"]["annotations"]["a"], "b");
        assert!(ops.iter().all(|o| o.description != "Service Account"));

        d.extensions.push(ExtensionPayload { kind: "spec".into(), payload: json!({"service_account": "other"}) });
        assert!(matches!(prepare_deployment(&opts(), &target(Purpose::Production, false), &d), Err(FerryError::BadInput(_))));
    }

    #[test]
    fn sidecars_secrets_and_planned_dependencies() {
        let mut d = base();
        d.secrets = Some(vec![SecretSpec { name: "tls".into(), value: SecretValue::Static("pem".into()) }]);
        d.secret_resources = vec![ferry_core::SecretResource { resource_ref: "acme/tls:cert".into(), secret_ref: "tls".into() }];
        d.planned_resource_deps = vec![PlannedDependency { resource_ref: "acme/db:main".into(), resource_instance_id: "db1".into() }];
        d.computed_resources = vec![ComputedResource { resource_instance_id: "db1".into(), instance_type: "db".into(), instance: json!({"host": "db"}) }];
        d.mount_runtime_config_path = Some("/cfg".into());
        d.volumes = vec![Volume { name: "scratch".into(), owner: "api".into(), kind: VolumeKind::Ephemeral }];
        d.sidecars = vec![ContainerSpec {
            name: "proxy".into(),
            image: ImageRef { repository: "reg/proxy".into(), ..Default::default() },
            mounts: vec![Mount { path: "/tmp".into(), volume: Some("scratch".into()), readonly: false }],
            ..Default::default()
        }];
        let ops = prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap();
        assert!(ops.iter().any(|o| o.description == "Managed secrets"));
        let rc: OpEnsureRuntimeConfig = ops.iter().find(|o| o.kind == OpEnsureRuntimeConfig::KIND).unwrap().decode().unwrap();
        assert_eq!(rc.injected_resources.len(), 2);
        let obj = ensure_of(&ops).resource.unwrap();
        let containers = &obj["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[1]["name"], "sidecar-proxy");
        assert_eq!(containers[1]["env"][0], json!({"name": "FERRY_DEPLOYABLE_NAME", "value": "api"}));
        assert_eq!(containers[1]["volumeMounts"][0]["name"], "v-scratch");

        d.sidecars.push(d.sidecars[0].clone());
        assert!(matches!(prepare_deployment(&opts(), &target(Purpose::Production, false), &d), Err(FerryError::BadInput(_))));
    }

    #[test]
    fn admin_namespace_and_manual_inhibit_events() {
        let mut d = base();
        let admin = DeploymentTarget { namespace: ADMIN_NAMESPACE.into(), ..target(Purpose::Production, false) };
        assert!(ensure_of(&prepare_deployment(&opts(), &admin, &d).unwrap()).inhibit_events);
        d.focused = true;
        assert!(!ensure_of(&prepare_deployment(&opts(), &admin, &d).unwrap()).inhibit_events);
        d.class = DeployableClass::Manual;
        assert!(ensure_of(&prepare_deployment(&opts(), &target(Purpose::Production, false), &d).unwrap()).inhibit_events);
    }
}
