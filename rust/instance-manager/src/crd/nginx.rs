//! The subset of the nginx operator's `Nginx` resource read by the manager

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "nginx.tsuru.io",
    version = "v1alpha1",
    kind = "Nginx",
    namespaced,
    status = "NginxStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct NginxSpec {
    #[serde(default)]
    pub pod_template: NginxPodTemplate,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NginxPodTemplate {
    #[serde(default)]
    pub ports: Vec<NginxPort>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NginxPort {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: i32,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NginxStatus {
    #[serde(default)]
    pub services: Vec<ObjectName>,
    #[serde(default)]
    pub ingresses: Vec<ObjectName>,
    #[serde(default)]
    pub pods: Vec<ObjectName>,
    /// Label selector (in query-string form) matching the nginx pods.
    #[serde(default)]
    pub pod_selector: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ObjectName {
    pub name: String,
}
