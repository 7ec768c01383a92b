//! Stable identifiers, labels and annotations.

use std::collections::BTreeMap;

use crate::deployable::{DeployableRef, Endpoint, Environment};

pub const FIELD_MANAGER: &str = "ferry";
pub const MANAGER_ID: &str = "ferry";
pub const PLANNER_VERSION: &str = "1";
pub const ADMIN_NAMESPACE: &str = "ferry-admin";
pub const EPHEMERAL_ENV_TIMEOUT: &str = "1h";

pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_DEPLOYABLE_ID: &str = "k8s.ferry.dev/deployable-id";
pub const LABEL_DEPLOYABLE_NAME: &str = "k8s.ferry.dev/deployable-name";
pub const LABEL_PACKAGE: &str = "k8s.ferry.dev/package";
pub const LABEL_ENV_PURPOSE: &str = "k8s.ferry.dev/env-purpose";
pub const LABEL_ENV_EPHEMERAL: &str = "k8s.ferry.dev/env-ephemeral";
pub const LABEL_ENV_NAME: &str = "k8s.ferry.dev/env-name";
pub const LABEL_KIND: &str = "k8s.ferry.dev/kind";
pub const LABEL_SERVICE: &str = "k8s.ferry.dev/service";

pub const KIND_RUNTIME_CONFIG: &str = "runtime-config";
pub const KIND_STATIC_CONFIG: &str = "static-config";

pub const ANN_PLANNER_VERSION: &str = "k8s.ferry.dev/planner-version";
pub const ANN_ENV_TIMEOUT: &str = "k8s.ferry.dev/env-timeout";
pub const ANN_RUNTIME_CONFIG: &str = "k8s.ferry.dev/runtime-config";
pub const ANN_CONFIG_IMAGE: &str = "k8s.ferry.dev/config-image";
pub const ANN_PACKAGE: &str = "k8s.ferry.dev/package";
pub const ANN_SERVICE_OWNER: &str = "k8s.ferry.dev/service-owner";
pub const ANN_GRPC_SERVICES: &str = "k8s.ferry.dev/grpc-services";

/// Lowercased name plus id; the cluster rejects uppercase object names.
pub fn deployment_id(name: &str, id: &str) -> String {
    if name.is_empty() { id.to_string() } else { format!("{}-{}", name.to_lowercase(), id) }
}

pub fn deployment_id_of(d: &DeployableRef) -> String { deployment_id(&d.name, &d.id) }

/// Join non-empty parts with `-`, lowercased.
pub fn make_resource_name(parts: &[&str]) -> String {
    parts.iter().filter(|p| !p.is_empty()).map(|p| p.to_lowercase()).collect::<Vec<_>>().join("-")
}

/// Turn an arbitrary string into something usable as a label value / dns fragment.
pub fn label_like(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    out.truncate(63);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

pub fn volume_name(name: &str) -> String { label_like(&format!("v-{}", name)) }

pub fn select_by_id(d: &DeployableRef) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_DEPLOYABLE_ID.to_string(), d.id.clone())])
}

pub fn base_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_MANAGED_BY.to_string(), MANAGER_ID.to_string())])
}

pub fn env_labels(env: &Environment) -> BTreeMap<String, String> {
    let mut m = base_labels();
    m.insert(LABEL_ENV_PURPOSE.into(), env.purpose.as_str().to_string());
    m.insert(LABEL_ENV_EPHEMERAL.into(), env.ephemeral.to_string());
    if !env.ephemeral && !env.name.is_empty() {
        m.insert(LABEL_ENV_NAME.into(), label_like(&env.name));
    }
    m
}

pub fn make_labels(env: &Environment, d: &DeployableRef) -> BTreeMap<String, String> {
    let mut m = env_labels(env);
    m.extend(select_by_id(d));
    if !d.name.is_empty() {
        m.insert(LABEL_DEPLOYABLE_NAME.into(), label_like(&d.name));
    }
    if !d.package_name.is_empty() {
        m.insert(LABEL_PACKAGE.into(), label_like(&d.package_name));
    }
    m
}

pub fn make_service_labels(env: &Environment, d: &DeployableRef, endpoint: &Endpoint) -> BTreeMap<String, String> {
    let mut m = make_labels(env, d);
    m.insert(LABEL_SERVICE.into(), label_like(&endpoint.service_name));
    m
}

pub fn base_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(ANN_PLANNER_VERSION.to_string(), PLANNER_VERSION.to_string())])
}

pub fn make_annotations(env: &Environment, package_name: &str) -> BTreeMap<String, String> {
    let mut m = base_annotations();
    if env.ephemeral {
        m.insert(ANN_ENV_TIMEOUT.into(), EPHEMERAL_ENV_TIMEOUT.into());
    }
    if !package_name.is_empty() {
        m.insert(ANN_PACKAGE.into(), package_name.to_string());
    }
    m
}

pub fn make_service_annotations(endpoint: &Endpoint, owner: &str) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    if !owner.is_empty() {
        m.insert(ANN_SERVICE_OWNER.to_string(), owner.to_string());
    }
    if !endpoint.grpc_services.is_empty() {
        m.insert(ANN_GRPC_SERVICES.to_string(), endpoint.grpc_services.join(","));
    }
    m.extend(endpoint.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployable::Purpose;

    fn dep() -> DeployableRef { DeployableRef { name: "API".into(), id: "x1".into(), package_name: "acme.dev/api".into(), ..Default::default() } }

    #[test]
    fn deployment_id_lowercases_and_falls_back() {
        assert_eq!(deployment_id("MyServer", "abc"), "myserver-abc");
        assert_eq!(deployment_id("", "abc"), "abc");
    }

    #[test]
    fn labels_depend_on_ephemerality() {
        let prod = Environment { name: "Prod".into(), purpose: Purpose::Production, ephemeral: false };
        let l = make_labels(&prod, &dep());
        assert_eq!(l[LABEL_ENV_PURPOSE], "production");
        assert_eq!(l[LABEL_ENV_NAME], "prod");
        assert_eq!(l[LABEL_DEPLOYABLE_ID], "x1");
        assert_eq!(l[APP_MANAGED_BY], MANAGER_ID);
        assert_eq!(l[LABEL_PACKAGE], "acme.dev-api");

        let test = Environment { name: "t-123".into(), purpose: Purpose::Testing, ephemeral: true };
        let l = make_labels(&test, &dep());
        assert!(!l.contains_key(LABEL_ENV_NAME));
        assert_eq!(l[LABEL_ENV_EPHEMERAL], "true");
        assert_eq!(make_annotations(&test, "")[ANN_ENV_TIMEOUT], "1h");
        assert!(!make_annotations(&prod, "").contains_key(ANN_ENV_TIMEOUT));
    }

    #[test]
    fn resource_names_skip_empty_parts() {
        assert_eq!(make_resource_name(&["api-x1", "", "ABCD1234", "runtimecfg"]), "api-x1-abcd1234-runtimecfg");
        assert_eq!(label_like("-Foo Bar/baz-"), "foo-bar-baz");
    }
}
