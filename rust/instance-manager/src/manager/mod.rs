//! The [`InstanceManager`] and the operations it offers, one module per subsystem
//!
//! Every mutation follows the same shape: load the instance and keep it as the original,
//! compute a target in memory, validate it, write child objects, then patch the instance
//! from original to target. A concurrent writer makes the patch fail with a conflict, which
//! is surfaced to the caller unchanged.

use std::{collections::BTreeMap, sync::Arc};

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    kube::{runtime::reflector::ObjectRef, ResourceExt},
};

use crate::{
    config::{OptionsHandle, RuntimeOptions},
    crd::RpaasInstance,
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway, Selector},
    labels,
};

pub mod acl;
pub mod autoscale;
pub mod bind;
pub mod block;
pub mod cert_manager;
pub mod certificate;
pub mod files;
pub mod info;
pub mod instance;
pub mod metadata;
pub mod plan;
pub mod purge;
pub mod route;
pub mod streams;
pub mod upstream;

#[cfg(test)]
mod test_util;

pub use purge::CachePurger;
pub use streams::RemoteShell;

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum GetInstanceError {
    #[snafu(display("rpaas instance named {name:?} not found"))]
    NotFound { name: String },

    #[snafu(display("found {count} rpaas instances named {name:?}"))]
    Ambiguous { name: String, count: usize },

    #[snafu(display("failed to look up rpaas instance {name:?}"))]
    Lookup {
        source: gateway::Error,
        name: String,
    },
}

impl ManagerError for GetInstanceError {
    fn kind(&self) -> ErrorKind {
        match self {
            GetInstanceError::NotFound { .. } => ErrorKind::NotFound,
            GetInstanceError::Ambiguous { .. } => ErrorKind::Conflict,
            GetInstanceError::Lookup { source, .. } => source.kind(),
        }
    }
}

/// Mediates every mutation of rpaas instances and the objects they own
pub struct InstanceManager<G> {
    client: G,
    uncached_client: G,
    options: OptionsHandle,
    remote_shell: Option<Arc<dyn RemoteShell>>,
    cache_purger: Option<Arc<dyn CachePurger>>,
}

impl<G: Gateway> InstanceManager<G> {
    /// `uncached_client` serves reads that must observe the latest cluster state, such as events
    pub fn new(client: G, uncached_client: G, options: OptionsHandle) -> Self {
        Self {
            client,
            uncached_client,
            options,
            remote_shell: None,
            cache_purger: None,
        }
    }

    pub fn with_remote_shell(mut self, remote_shell: Arc<dyn RemoteShell>) -> Self {
        self.remote_shell = Some(remote_shell);
        self
    }

    pub fn with_cache_purger(mut self, cache_purger: Arc<dyn CachePurger>) -> Self {
        self.cache_purger = Some(cache_purger);
        self
    }

    /// Snapshot of the runtime options, taken once per operation
    pub fn options(&self) -> Arc<RuntimeOptions> {
        self.options.snapshot()
    }

    pub async fn get_instance(&self, name: &str) -> Result<RpaasInstance, GetInstanceError> {
        let opts = self.options();
        self.find_instance(&opts, name).await
    }

    async fn find_instance(
        &self,
        opts: &RuntimeOptions,
        name: &str,
    ) -> Result<RpaasInstance, GetInstanceError> {
        use get_instance_error::*;
        if opts.namespaced_instances {
            let selector = Selector::labels(BTreeMap::from([
                (
                    labels::LABEL_SERVICE_NAME.to_string(),
                    opts.service_name.clone(),
                ),
                (labels::LABEL_INSTANCE_NAME.to_string(), name.to_string()),
            ]));
            let mut instances = self
                .client
                .list::<RpaasInstance>(None, &selector)
                .await
                .context(LookupSnafu { name })?;
            instances.retain(|instance| instance.name_any() == name);
            match instances.len() {
                0 => NotFoundSnafu { name }.fail(),
                1 => Ok(instances.remove(0)),
                count => AmbiguousSnafu { name, count }.fail(),
            }
        } else {
            self.client
                .get_opt::<RpaasInstance>(&opts.service_name, name)
                .await
                .context(LookupSnafu { name })?
                .ok_or_else(|| NotFoundSnafu { name }.build())
        }
    }

    /// Writes `target` over `original`, failing if `original` is no longer current
    async fn patch_instance(
        &self,
        original: &RpaasInstance,
        target: &RpaasInstance,
    ) -> Result<RpaasInstance, gateway::Error> {
        let patched = self.client.patch(original, target).await?;
        tracing::info!(
            instance = %ObjectRef::from_obj(target),
            resource_version = patched.metadata.resource_version.as_deref(),
            "updated rpaas instance"
        );
        Ok(patched)
    }
}

/// Namespace of an object loaded from the cluster
fn namespace_of(instance: &RpaasInstance) -> String {
    instance.namespace().unwrap_or_default()
}

/// Metadata of an object owned by `instance`, carrying the instance labels plus `extra_labels`
fn child_metadata(
    instance: &RpaasInstance,
    extra_labels: BTreeMap<String, String>,
) -> Result<ObjectMeta, stackable_operator::builder::meta::Error> {
    let mut metadata = ObjectMetaBuilder::new()
        .namespace(namespace_of(instance))
        .ownerreference_from_resource(instance, None, Some(true))?
        .build();
    let mut child_labels = labels::instance_labels(
        instance.service_name().unwrap_or_default(),
        &instance.name_any(),
    );
    child_labels.extend(extra_labels);
    metadata.labels = Some(child_labels);
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::test_util::{instance, manager, Cluster};
    use crate::error::{ErrorKind, ManagerError};

    #[tokio::test]
    async fn get_instance() {
        let cluster = Cluster::new();
        cluster.gateway.insert(instance("my-instance"));
        let manager = manager(&cluster);
        assert_eq!(
            manager
                .get_instance("my-instance")
                .await
                .unwrap()
                .metadata
                .name
                .as_deref(),
            Some("my-instance")
        );
        let err = manager.get_instance("other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "rpaas instance named \"other\" not found");
    }

    #[tokio::test]
    async fn get_namespaced_instance() {
        let cluster = Cluster::namespaced();
        let mut pooled = instance("my-instance");
        pooled.metadata.namespace = Some("rpaasv2-pool-a".to_string());
        cluster.gateway.insert(pooled);
        let manager = manager(&cluster);
        let found = manager.get_instance("my-instance").await.unwrap();
        assert_eq!(found.metadata.namespace.as_deref(), Some("rpaasv2-pool-a"));
        assert!(manager.get_instance("other").await.is_err());
    }
}
