//! Fixtures for the manager tests

use std::collections::BTreeMap;

use stackable_operator::k8s_openapi::{
    api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use super::InstanceManager;
use crate::{
    config::{OptionsHandle, RuntimeOptions},
    crd::{Bind, RpaasFlavor, RpaasFlavorSpec, RpaasInstance, RpaasInstanceSpec, RpaasPlan, RpaasPlanSpec},
    gateway::fake::FakeGateway,
    labels,
};

pub const SERVICE: &str = "rpaasv2";

pub struct Cluster {
    pub gateway: FakeGateway,
    pub options: RuntimeOptions,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            gateway: FakeGateway::new(),
            options: RuntimeOptions {
                service_name: SERVICE.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn namespaced() -> Self {
        let mut cluster = Self::new();
        cluster.options.namespaced_instances = true;
        cluster
    }

    pub fn instance(&self, name: &str) -> RpaasInstance {
        self.gateway.object(SERVICE, name).unwrap()
    }
}

pub fn manager(cluster: &Cluster) -> InstanceManager<FakeGateway> {
    InstanceManager::new(
        cluster.gateway.clone(),
        cluster.gateway.clone(),
        OptionsHandle::fixed(cluster.options.clone()),
    )
}

pub fn metadata(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// An instance of team `team-one` on plan `basic`, as created by the manager
pub fn instance(name: &str) -> RpaasInstance {
    let mut instance = RpaasInstance::new(
        name,
        RpaasInstanceSpec {
            replicas: Some(1),
            plan_name: "basic".to_string(),
            ..Default::default()
        },
    );
    let mut instance_labels = labels::instance_labels(SERVICE, name);
    instance_labels.insert(labels::LABEL_TEAM_OWNER.to_string(), "team-one".to_string());
    instance.metadata.namespace = Some(SERVICE.to_string());
    instance.metadata.labels = Some(instance_labels);
    instance.metadata.annotations = Some(BTreeMap::from([(
        labels::ANNOTATION_TEAM_OWNER.to_string(),
        "team-one".to_string(),
    )]));
    instance
}

pub fn with_binds(mut instance: RpaasInstance, binds: &[&str]) -> RpaasInstance {
    instance.spec.binds = binds
        .iter()
        .map(|bind| Bind {
            name: bind.to_string(),
            host: format!("{bind}.apps.example.com"),
        })
        .collect();
    instance
}

pub fn plan(name: &str, default: bool) -> RpaasPlan {
    let mut plan = RpaasPlan::new(
        name,
        RpaasPlanSpec {
            description: Some(format!("{name} plan")),
            default,
            ..Default::default()
        },
    );
    plan.metadata.namespace = Some(SERVICE.to_string());
    plan
}

pub fn flavor(name: &str, spec: RpaasFlavorSpec) -> RpaasFlavor {
    let mut flavor = RpaasFlavor::new(name, spec);
    flavor.metadata.namespace = Some(SERVICE.to_string());
    flavor
}

pub fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: metadata(SERVICE, name),
        data: Some(
            data.iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}
