use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::ResourceRequirements,
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

/// A resource-and-template bundle instances are created from. At most one plan per
/// namespace should be marked as default.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.tsuru.io",
    version = "v1alpha1",
    kind = "RpaasPlan",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct RpaasPlanSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// nginx image used by instances of this plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Used when an instance is created without naming a plan.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,

    #[serde(default)]
    pub config: PlanConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_processes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_connections: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A named capability set selectable at creation time
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.tsuru.io",
    version = "v1alpha1",
    kind = "RpaasFlavor",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct RpaasFlavorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Applied by the operator to every instance, never selected explicitly.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,

    /// May only be chosen when the instance is created.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub creation_only: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incompatible_flavors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_template: Option<RpaasPlanSpec>,
}
