//! `PodMetrics` served by the [metrics-server](https://github.com/kubernetes-sigs/metrics-server)
//! aggregated API. It has no spec/status split, so [`Resource`] is implemented by hand.

use std::{borrow::Cow, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{
        apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
        NamespaceResourceScope,
    },
    kube::Resource,
};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContainerMetrics {
    pub name: String,
    /// Keyed by resource name, usually `cpu` and `memory`.
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

impl Resource for PodMetrics {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "PodMetrics".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "metrics.k8s.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1beta1".into()
    }

    fn api_version(_: &()) -> Cow<'_, str> {
        "metrics.k8s.io/v1beta1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "pods".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
