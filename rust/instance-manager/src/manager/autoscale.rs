//! Horizontal autoscaling settings

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

use super::{GetInstanceError, InstanceManager};
use crate::{
    crd::{AutoscaleSpec, RpaasInstance},
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway},
    validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid autoscale"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("autoscale already exists"))]
    AlreadyExists,

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::AlreadyExists => ErrorKind::Conflict,
            Error::PatchInstance { source } => source.kind(),
        }
    }
}

/// Autoscale fields as sent by a caller, unset fields keep their current value on update
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleArgs {
    pub max_replicas: Option<i32>,
    pub min_replicas: Option<i32>,
    pub target_cpu_utilization_percentage: Option<i32>,
    pub target_memory_utilization_percentage: Option<i32>,
    pub target_requests_per_second: Option<i32>,
}

impl AutoscaleArgs {
    fn merge_into(self, current: AutoscaleSpec) -> AutoscaleSpec {
        AutoscaleSpec {
            max_replicas: self.max_replicas.unwrap_or(current.max_replicas),
            min_replicas: self.min_replicas.or(current.min_replicas),
            target_cpu_utilization_percentage: self
                .target_cpu_utilization_percentage
                .or(current.target_cpu_utilization_percentage),
            target_memory_utilization_percentage: self
                .target_memory_utilization_percentage
                .or(current.target_memory_utilization_percentage),
            target_requests_per_second: self
                .target_requests_per_second
                .or(current.target_requests_per_second),
        }
    }
}

impl<G: Gateway> InstanceManager<G> {
    pub async fn create_autoscale(&self, name: &str, args: AutoscaleArgs) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        ensure!(original.spec.autoscale.is_none(), error::AlreadyExistsSnafu);
        self.write_autoscale(original, args.merge_into(AutoscaleSpec::default()))
            .await
    }

    /// Creates the autoscale if missing, otherwise merges `args` over the current one
    pub async fn update_autoscale(&self, name: &str, args: AutoscaleArgs) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let current = original.spec.autoscale.clone().unwrap_or_default();
        self.write_autoscale(original, args.merge_into(current)).await
    }

    pub async fn delete_autoscale(&self, name: &str) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        target.spec.autoscale = None;
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn get_autoscale(&self, name: &str) -> Result<Option<AutoscaleSpec>, Error> {
        Ok(self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?
            .spec
            .autoscale)
    }

    async fn write_autoscale(
        &self,
        original: RpaasInstance,
        autoscale: AutoscaleSpec,
    ) -> Result<(), Error> {
        validation::autoscale(&autoscale).context(error::ValidationSnafu)?;
        let mut target = original.clone();
        target.spec.autoscale = Some(autoscale);
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }
}
