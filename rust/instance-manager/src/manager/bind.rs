//! Applications bound to an instance

use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::{GetInstanceError, InstanceManager};
use crate::{
    crd::Bind,
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway},
    validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid bind"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("host {host:?} is already bound to the instance"))]
    AlreadyBound { host: String },

    #[snafu(display("app {app:?} is not bound to the instance"))]
    NotBound { app: String },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::AlreadyBound { .. } => ErrorKind::Conflict,
            Error::NotBound { .. } => ErrorKind::NotFound,
            Error::PatchInstance { source } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindArgs {
    pub app_name: String,
    /// Externally reachable host of the app
    pub app_host: String,
    /// Cluster-local address, preferred when the app runs in the instance's cluster
    #[serde(default)]
    pub app_internal_host: Option<String>,
    #[serde(default)]
    pub app_cluster_name: Option<String>,
}

impl<G: Gateway> InstanceManager<G> {
    pub async fn bind_app(&self, name: &str, args: BindArgs) -> Result<(), Error> {
        validation::app_name(&args.app_name).context(error::ValidationSnafu)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;

        let same_cluster = match (original.cluster_name(), args.app_cluster_name.as_deref()) {
            (Some(instance_cluster), Some(app_cluster)) => {
                !instance_cluster.is_empty() && instance_cluster == app_cluster
            }
            _ => false,
        };
        let host = match args.app_internal_host.as_deref() {
            Some(internal) if same_cluster && !internal.is_empty() => internal,
            _ => args.app_host.as_str(),
        };
        let host = validation::bind_host(host).context(error::ValidationSnafu)?;

        let mut target = original.clone();
        ensure!(
            !target.spec.binds.iter().any(|bind| bind.host == host),
            error::AlreadyBoundSnafu { host }
        );
        target.spec.binds.push(Bind {
            name: args.app_name,
            host,
        });
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Removes the first bind of `app_name`, keeping the order of the others
    pub async fn unbind_app(&self, name: &str, app_name: &str) -> Result<(), Error> {
        validation::app_name(app_name).context(error::ValidationSnafu)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        let index = target
            .spec
            .binds
            .iter()
            .position(|bind| bind.name == app_name)
            .context(error::NotBoundSnafu { app: app_name })?;
        target.spec.binds.remove(index);
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn get_binds(&self, name: &str) -> Result<Vec<Bind>, Error> {
        Ok(self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?
            .spec
            .binds)
    }
}
