//! Cache purging, delegated per pod to a [`CachePurger`] hook

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::kube::ResourceExt;

use super::{info, GetInstanceError, InstanceManager};
use crate::{
    crd::NginxPort,
    error::{ErrorKind, ManagerError},
    gateway::Gateway,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("path is required"))]
    MissingPath,

    #[snafu(display("cache purging is not available"))]
    NoPurger,

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("failed to list pods"))]
    ListPods { source: info::Error },

    #[snafu(display("failed to purge {path:?} on any pod"))]
    Purge { source: BoxError, path: String },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingPath => ErrorKind::Validation,
            Error::NoPurger | Error::Purge { .. } => ErrorKind::Internal,
            Error::GetInstance { source } => source.kind(),
            Error::ListPods { source } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeCacheArgs {
    pub path: String,
    /// Purge only the exact path, keeping entries of its variants
    #[serde(default)]
    pub preserve_path: bool,
}

/// A running nginx pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub ports: Vec<NginxPort>,
}

/// Removes cached entries from one nginx pod
#[async_trait]
pub trait CachePurger: Send + Sync {
    async fn purge(&self, target: &PodTarget, args: &PurgeCacheArgs) -> Result<(), BoxError>;
}

impl<G: Gateway> InstanceManager<G> {
    /// Purges `args.path` on every running pod, returning how many pods succeeded
    pub async fn purge_cache(&self, name: &str, args: PurgeCacheArgs) -> Result<usize, Error> {
        ensure!(!args.path.is_empty(), error::MissingPathSnafu);
        let purger = self.cache_purger.as_ref().context(error::NoPurgerSnafu)?;
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let Some(nginx) = self
            .nginx(&instance)
            .await
            .context(error::ListPodsSnafu)?
        else {
            return Ok(0);
        };
        let pods = self
            .nginx_pods(&instance, &nginx)
            .await
            .context(error::ListPodsSnafu)?;

        let targets = pods
            .into_iter()
            .filter_map(|pod| {
                let status = pod.status.as_ref()?;
                let ip = status.pod_ip.clone()?;
                (status.phase.as_deref() == Some("Running")).then(|| PodTarget {
                    namespace: pod.namespace().unwrap_or_default(),
                    name: pod.name_any(),
                    ip,
                    ports: nginx.spec.pod_template.ports.clone(),
                })
            })
            .collect::<Vec<_>>();
        let results = join_all(targets.iter().map(|target| purger.purge(target, &args))).await;

        let mut purged = 0;
        let mut last_error = None;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => purged += 1,
                Err(err) => {
                    tracing::warn!(
                        pod = %target.name,
                        path = %args.path,
                        error = &*err as &dyn std::error::Error,
                        "failed to purge cache"
                    );
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(source) if purged == 0 => Err(Error::Purge {
                source,
                path: args.path,
            }),
            _ => {
                tracing::info!(instance = name, path = %args.path, purged, "purged cache");
                Ok(purged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;
    use stackable_operator::k8s_openapi::api::core::v1::Pod;

    use super::{BoxError, CachePurger, PodTarget, PurgeCacheArgs};
    use crate::{
        crd::{Nginx, NginxSpec, NginxStatus},
        error::{ErrorKind, ManagerError},
        manager::test_util::{instance, manager, Cluster, SERVICE},
    };

    #[derive(Default)]
    struct RecordingPurger {
        failing: Vec<String>,
        purged: Mutex<Vec<(String, String, bool)>>,
    }

    #[async_trait]
    impl CachePurger for RecordingPurger {
        async fn purge(&self, target: &PodTarget, args: &PurgeCacheArgs) -> Result<(), BoxError> {
            if self.failing.contains(&target.name) {
                return Err(format!("{} refused the purge", target.name).into());
            }
            self.purged.lock().unwrap().push((
                target.ip.clone(),
                args.path.clone(),
                args.preserve_path,
            ));
            Ok(())
        }
    }

    fn pod(name: &str, ip: &str, phase: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": SERVICE,
                "labels": {"nginx.tsuru.io/resource-name": "r1"},
            },
            "status": {"phase": phase, "podIP": ip},
        }))
        .unwrap()
    }

    fn cluster() -> Cluster {
        let cluster = Cluster::new();
        cluster.gateway.insert(instance("r1"));
        let mut nginx = Nginx::new("r1", NginxSpec::default());
        nginx.metadata.namespace = Some(SERVICE.to_string());
        nginx.status = Some(NginxStatus {
            pod_selector: Some("nginx.tsuru.io/resource-name=r1".to_string()),
            ..Default::default()
        });
        cluster.gateway.insert(nginx);
        cluster.gateway.insert(pod("r1-a", "10.0.0.1", "Running"));
        cluster.gateway.insert(pod("r1-b", "10.0.0.2", "Running"));
        cluster.gateway.insert(pod("r1-c", "10.0.0.3", "Pending"));
        cluster
    }

    fn args(path: &str) -> PurgeCacheArgs {
        PurgeCacheArgs {
            path: path.to_string(),
            preserve_path: true,
        }
    }

    #[tokio::test]
    async fn purges_running_pods() {
        let cluster = cluster();
        let purger = Arc::new(RecordingPurger {
            failing: vec!["r1-b".to_string()],
            ..Default::default()
        });
        let manager = manager(&cluster).with_cache_purger(purger.clone());

        assert_eq!(manager.purge_cache("r1", args("/index.html")).await.unwrap(), 1);
        assert_eq!(
            *purger.purged.lock().unwrap(),
            [("10.0.0.1".to_string(), "/index.html".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn fails_when_no_pod_was_purged() {
        let cluster = cluster();
        let purger = Arc::new(RecordingPurger {
            failing: vec!["r1-a".to_string(), "r1-b".to_string()],
            ..Default::default()
        });
        let manager = manager(&cluster).with_cache_purger(purger);
        let err = manager
            .purge_cache("r1", args("/index.html"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(crate::error::error_full_message(&err).contains("refused the purge"));
    }

    #[tokio::test]
    async fn requires_path_and_purger() {
        let cluster = cluster();
        let err = manager(&cluster)
            .purge_cache("r1", args("/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let manager = manager(&cluster).with_cache_purger(Arc::new(RecordingPurger::default()));
        let err = manager.purge_cache("r1", args("")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
