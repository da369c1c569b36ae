//! Load-balancing and canary options of the upstreams derived from binds

use std::collections::BTreeSet;

use snafu::{OptionExt, ResultExt, Snafu};

use super::{GetInstanceError, InstanceManager};
use crate::{
    crd::UpstreamOptions,
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway},
    validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid upstream options"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("upstream options for bind {primary_bind:?} not found"))]
    NotFound { primary_bind: String },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PatchInstance { source } => source.kind(),
        }
    }
}

/// A record as sent by a caller, it replaces the stored record of the same primary bind
pub type UpstreamOptionsArgs = UpstreamOptions;

impl<G: Gateway> InstanceManager<G> {
    pub async fn ensure_upstream_options(
        &self,
        name: &str,
        args: UpstreamOptionsArgs,
    ) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let bind_names = original
            .spec
            .binds
            .iter()
            .map(|bind| bind.name.as_str())
            .collect::<BTreeSet<_>>();
        let record =
            validation::upstream_options(args, &bind_names).context(error::ValidationSnafu)?;
        let primary_bind = record.primary_bind.clone();

        let mut target = original.clone();
        let records = &mut target.spec.upstream_options;
        match records
            .iter_mut()
            .find(|existing| existing.primary_bind == primary_bind)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        validation::upstream_graph(records, &primary_bind).context(error::ValidationSnafu)?;

        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Removes the record of `primary_bind` and every canary reference to it
    pub async fn delete_upstream_options(&self, name: &str, primary_bind: &str) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        let records = &mut target.spec.upstream_options;
        let index = records
            .iter()
            .position(|record| record.primary_bind == primary_bind)
            .context(error::NotFoundSnafu { primary_bind })?;
        records.remove(index);
        for record in records.iter_mut() {
            record.canary_binds.retain(|canary| canary != primary_bind);
        }

        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn get_upstream_options(&self, name: &str) -> Result<Vec<UpstreamOptions>, Error> {
        Ok(self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?
            .spec
            .upstream_options)
    }
}
