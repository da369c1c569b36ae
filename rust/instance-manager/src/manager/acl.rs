//! Upstreams an instance is allowed to reach

use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::{GetInstanceError, InstanceManager};
use crate::{
    crd::AllowedUpstream,
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway},
    validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid upstream"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("upstream {host}:{port} already allowed"))]
    AlreadyExists { host: String, port: i32 },

    #[snafu(display("upstream {host}:{port} not found"))]
    NotFound { host: String, port: i32 },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::AlreadyExists { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PatchInstance { source } => source.kind(),
        }
    }
}

impl<G: Gateway> InstanceManager<G> {
    pub async fn add_upstream(&self, name: &str, upstream: AllowedUpstream) -> Result<(), Error> {
        validation::upstream_host(&upstream.host).context(error::ValidationSnafu)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        ensure!(
            !target.spec.allowed_upstreams.contains(&upstream),
            error::AlreadyExistsSnafu {
                host: &upstream.host,
                port: upstream.port,
            }
        );
        target.spec.allowed_upstreams.push(upstream);
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn delete_upstream(&self, name: &str, upstream: AllowedUpstream) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        let index = target
            .spec
            .allowed_upstreams
            .iter()
            .position(|allowed| *allowed == upstream)
            .context(error::NotFoundSnafu {
                host: &upstream.host,
                port: upstream.port,
            })?;
        target.spec.allowed_upstreams.remove(index);
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn get_upstreams(&self, name: &str) -> Result<Vec<AllowedUpstream>, Error> {
        Ok(self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?
            .spec
            .allowed_upstreams)
    }
}
