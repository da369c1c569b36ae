//! User-defined labels and annotations of an instance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use super::{GetInstanceError, InstanceManager};
use crate::{
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway},
    labels, validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid metadata"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("{kind} {name:?} not found"))]
    NotFound { kind: &'static str, name: String },

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

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl MetadataItem {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub labels: Vec<MetadataItem>,
    #[serde(default)]
    pub annotations: Vec<MetadataItem>,
}

fn visible(map: Option<&BTreeMap<String, String>>) -> Vec<MetadataItem> {
    map.into_iter()
        .flatten()
        .filter(|(key, _)| !labels::is_reserved(key))
        .map(|(key, value)| MetadataItem::new(key, value))
        .collect()
}

fn check_keys(items: &[MetadataItem]) -> Result<(), Error> {
    for item in items {
        validation::metadata_key(&item.name).context(error::ValidationSnafu)?;
    }
    Ok(())
}

fn unset(
    map: &mut Option<BTreeMap<String, String>>,
    items: &[MetadataItem],
    kind: &'static str,
) -> Result<(), Error> {
    let map = map.get_or_insert_with(BTreeMap::new);
    for item in items {
        ensure!(
            map.remove(&item.name).is_some(),
            error::NotFoundSnafu {
                kind,
                name: &item.name
            }
        );
    }
    Ok(())
}

impl<G: Gateway> InstanceManager<G> {
    /// Labels and annotations outside of the reserved prefix
    pub async fn get_metadata(&self, name: &str) -> Result<Metadata, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        Ok(Metadata {
            labels: visible(instance.metadata.labels.as_ref()),
            annotations: visible(instance.metadata.annotations.as_ref()),
        })
    }

    pub async fn set_metadata(&self, name: &str, metadata: Metadata) -> Result<(), Error> {
        check_keys(&metadata.labels)?;
        check_keys(&metadata.annotations)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        let target_meta = &mut target.metadata;
        for (map, items) in [
            (&mut target_meta.labels, metadata.labels),
            (&mut target_meta.annotations, metadata.annotations),
        ] {
            map.get_or_insert_with(BTreeMap::new)
                .extend(items.into_iter().map(|item| (item.name, item.value)));
        }
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Removes the named items, failing if any of them is not set
    pub async fn unset_metadata(&self, name: &str, metadata: Metadata) -> Result<(), Error> {
        check_keys(&metadata.labels)?;
        check_keys(&metadata.annotations)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        unset(&mut target.metadata.labels, &metadata.labels, "label")?;
        unset(
            &mut target.metadata.annotations,
            &metadata.annotations,
            "annotation",
        )?;
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }
}
