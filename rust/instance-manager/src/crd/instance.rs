use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::Affinity,
    kube::CustomResource,
    schemars::{self, JsonSchema},
};
use strum::{Display, EnumIter, EnumString};

use super::RpaasPlanSpec;
use crate::labels;

/// A managed proxy instance. The nginx operator materialises it into pods, a service and
/// (optionally) ingresses.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.tsuru.io",
    version = "v1alpha1",
    kind = "RpaasInstance",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct RpaasInstanceSpec {
    /// Number of desired pods. Left unset, the operator decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Name of the [`super::RpaasPlan`] in the instance namespace.
    #[serde(default)]
    pub plan_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flavors: Vec<String>,

    /// Overrides merged over the referenced plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_template: Option<RpaasPlanSpec>,

    /// Applications bound to this instance, in bind order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<Bind>,

    /// Configuration fragments inserted into the nginx configuration, one per scope.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks: BTreeMap<BlockType, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale: Option<AutoscaleSpec>,

    /// Statically uploaded certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<TlsSecret>,

    /// Certificates requested from cert-manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_certificates: Option<DynamicCertificates>,

    /// Extra files mounted into the nginx pods, by file name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, ConfigMapKeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,

    #[serde(default)]
    pub pod_template: PodTemplateSpec,

    /// Upstreams reachable from Lua code running in the instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_upstreams: Vec<AllowedUpstream>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_options: Vec<UpstreamOptions>,

    /// Asks the operator to roll the nginx pods once, after which it resets the flag.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rollout_nginx_once: bool,
}

impl RpaasInstance {
    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.label(labels::LABEL_SERVICE_NAME)
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.label(labels::LABEL_CLUSTER_NAME)
    }

    pub fn description(&self) -> Option<&str> {
        self.annotation(labels::ANNOTATION_DESCRIPTION)
    }

    /// Team owning the instance, falling back from annotations to labels to the pod template
    pub fn team(&self) -> Option<&str> {
        self.annotation(labels::ANNOTATION_TEAM_OWNER)
            .or_else(|| self.label(labels::LABEL_TEAM_OWNER))
            .or_else(|| {
                self.spec
                    .pod_template
                    .labels
                    .get(labels::LABEL_TEAM_OWNER)
                    .map(String::as_str)
            })
    }

    pub fn tags(&self) -> Vec<String> {
        self.annotation(labels::ANNOTATION_TAGS)
            .filter(|tags| !tags.is_empty())
            .map(|tags| tags.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    JsonSchema,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BlockType {
    Root,
    Server,
    Http,
    LuaServer,
    LuaWorker,
}

/// Either inline content or a reference to a key of a ConfigMap in the instance namespace
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    #[serde(rename = "value")]
    Inline(String),
    ConfigMapKeyRef(ConfigMapKeyRef),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapKeyRef {
    pub name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, rename = "forceHTTPS", skip_serializing_if = "std::ops::Not::not")]
    pub force_https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
    pub name: String,
    pub host: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleSpec {
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(
        default,
        rename = "targetCPUUtilizationPercentage",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_cpu_utilization_percentage: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_memory_utilization_percentage: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_requests_per_second: Option<i32>,
}

/// Reference to the Secret holding static certificates
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecret {
    pub secret_name: String,
    /// Certificate entries in upload order.
    #[serde(default)]
    pub items: Vec<TlsSecretItem>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecretItem {
    pub certificate_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,
    pub key_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicCertificates {
    /// Single request kept for instances created before multiple requests were supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_manager: Option<CertManager>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cert_manager_requests: Vec<CertManager>,
}

impl DynamicCertificates {
    pub fn is_empty(&self) -> bool {
        self.cert_manager.is_none() && self.cert_manager_requests.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertManager {
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedUpstream {
    pub host: String,
    /// `0` allows every port.
    #[serde(default)]
    pub port: i32,
}

/// Load-balancing and canary settings of one bind
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamOptions {
    pub primary_bind: String,
    /// Binds receiving a share of this bind's traffic. At most one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub canary_binds: Vec<String>,
    #[serde(default, skip_serializing_if = "TrafficShapingPolicy::is_empty")]
    pub traffic_shaping_policy: TrafficShapingPolicy,
    #[serde(default)]
    pub load_balance: LoadBalance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balance_hash_key: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficShapingPolicy {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub weight: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub weight_total: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl TrafficShapingPolicy {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    JsonSchema,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadBalance {
    #[default]
    RoundRobin,
    Chash,
    Ewma,
}
