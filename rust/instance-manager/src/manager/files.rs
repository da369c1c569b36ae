//! Extra files, each stored in its own ConfigMap owned by the instance

use std::collections::BTreeMap;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::ConfigMap, ByteString},
    kube::{runtime::reflector::ObjectRef, ResourceExt},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::{child_metadata, namespace_of, GetInstanceError, InstanceManager};
use crate::{
    crd::{ConfigMapKeyRef, RpaasInstance},
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway, Selector},
    labels, validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("at least one file is required"))]
    NoFiles,

    #[snafu(display("invalid file"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("file {name:?} already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("file {name:?} not found"))]
    NotFound { name: String },

    #[snafu(display("too many config maps for {name} file"))]
    TooManyConfigMaps { name: String },

    #[snafu(display("no changes found in {name}"))]
    NotModified { name: String },

    #[snafu(display("failed to look up the ConfigMap of file {name:?}"))]
    ListConfigMaps {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("failed to build metadata for file {name:?}"))]
    BuildMetadata {
        source: stackable_operator::builder::meta::Error,
        name: String,
    },

    #[snafu(display("failed to write the ConfigMap of file {name:?}"))]
    WriteConfigMap {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("failed to delete the ConfigMap of file {name:?}"))]
    DeleteConfigMap {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("failed to read file {name:?}"))]
    ReadConfigMap {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("content of file {name:?} is missing from ConfigMap {config_map:?}"))]
    MissingContent { name: String, config_map: String },

    #[snafu(display("failed to format the update timestamp"))]
    FormatTimestamp { source: time::error::Format },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::NoFiles | Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::AlreadyExists { .. } | Error::TooManyConfigMaps { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } | Error::MissingContent { .. } => ErrorKind::NotFound,
            Error::NotModified { .. } => ErrorKind::NotModified,
            Error::ListConfigMaps { source, .. }
            | Error::WriteConfigMap { source, .. }
            | Error::DeleteConfigMap { source, .. }
            | Error::ReadConfigMap { source, .. }
            | Error::PatchInstance { source } => source.kind(),
            Error::BuildMetadata { .. } | Error::FormatTimestamp { .. } => ErrorKind::Internal,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub content: Vec<u8>,
}

impl File {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

fn validate(files: &[File]) -> Result<(), Error> {
    ensure!(!files.is_empty(), error::NoFilesSnafu);
    for file in files {
        validation::file(&file.name, &file.content).context(error::ValidationSnafu)?;
    }
    Ok(())
}

fn file_selector(instance: &RpaasInstance, name: &str) -> Selector {
    Selector::labels(labels::extra_file_labels(
        instance.service_name().unwrap_or_default(),
        &instance.name_any(),
        name,
    ))
}

/// Marks the pod template so that the operator rolls the pods
fn bump_last_update(instance: &mut RpaasInstance) -> Result<(), Error> {
    let now = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context(error::FormatTimestampSnafu)?;
    instance.spec.pod_template.annotations.insert(
        labels::ANNOTATION_EXTRA_FILES_LAST_UPDATE.to_string(),
        now,
    );
    Ok(())
}

fn file_data(file: &File) -> BTreeMap<String, ByteString> {
    BTreeMap::from([(file.name.clone(), ByteString(file.content.clone()))])
}

impl<G: Gateway> InstanceManager<G> {
    /// Creates or replaces files, failing with NotModified when a file is unchanged
    pub async fn update_extra_files(&self, name: &str, files: Vec<File>) -> Result<(), Error> {
        validate(&files)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        self.write_files(original, &files).await
    }

    /// Like [`Self::update_extra_files`], but refuses to overwrite existing files
    pub async fn add_extra_files(&self, name: &str, files: Vec<File>) -> Result<(), Error> {
        validate(&files)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        for file in &files {
            ensure!(
                !original.spec.files.contains_key(&file.name),
                error::AlreadyExistsSnafu { name: &file.name }
            );
        }
        self.write_files(original, &files).await
    }

    pub async fn delete_extra_files(&self, name: &str, names: &[String]) -> Result<(), Error> {
        ensure!(!names.is_empty(), error::NoFilesSnafu);
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        for file in names {
            ensure!(
                original.spec.files.contains_key(file),
                error::NotFoundSnafu { name: file }
            );
        }

        let namespace = namespace_of(&original);
        let mut target = original.clone();
        for file in names {
            let config_maps = self
                .client
                .list::<ConfigMap>(Some(&namespace), &file_selector(&original, file))
                .await
                .context(error::ListConfigMapsSnafu { name: file })?;
            for config_map in config_maps {
                match self.client.delete(&config_map).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(source) => {
                        return Err(Error::DeleteConfigMap {
                            source,
                            name: file.clone(),
                        })
                    }
                }
                tracing::info!(
                    config_map = %ObjectRef::from_obj(&config_map),
                    file = %file,
                    "deleted extra file"
                );
            }
            target.spec.files.remove(file);
        }
        bump_last_update(&mut target)?;
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Files sorted by name
    pub async fn get_extra_files(&self, name: &str) -> Result<Vec<File>, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let namespace = namespace_of(&instance);
        let mut files = Vec::with_capacity(instance.spec.files.len());
        for (file, key_ref) in &instance.spec.files {
            let config_map = self
                .client
                .get::<ConfigMap>(&namespace, &key_ref.name)
                .await
                .context(error::ReadConfigMapSnafu { name: file })?;
            let content = config_map
                .binary_data
                .and_then(|mut data| data.remove(&key_ref.key))
                .map(|content| content.0)
                .or_else(|| {
                    config_map
                        .data
                        .and_then(|mut data| data.remove(&key_ref.key))
                        .map(String::into_bytes)
                })
                .context(error::MissingContentSnafu {
                    name: file,
                    config_map: &key_ref.name,
                })?;
            files.push(File::new(file, content));
        }
        Ok(files)
    }

    /// Writes every ConfigMap before touching the instance, so a failed file leaves the
    /// instance unchanged
    async fn write_files(&self, original: RpaasInstance, files: &[File]) -> Result<(), Error> {
        let namespace = namespace_of(&original);
        let mut target = original.clone();
        for file in files {
            let mut config_maps = self
                .client
                .list::<ConfigMap>(Some(&namespace), &file_selector(&original, &file.name))
                .await
                .context(error::ListConfigMapsSnafu { name: &file.name })?;
            ensure!(
                config_maps.len() <= 1,
                error::TooManyConfigMapsSnafu { name: &file.name }
            );
            let written = match config_maps.pop() {
                Some(mut config_map) => {
                    let data = file_data(file);
                    ensure!(
                        config_map.binary_data.as_ref() != Some(&data),
                        error::NotModifiedSnafu { name: &file.name }
                    );
                    config_map.binary_data = Some(data);
                    config_map.data = None;
                    self.client
                        .update(&config_map)
                        .await
                        .context(error::WriteConfigMapSnafu { name: &file.name })?
                }
                None => {
                    let mut metadata = child_metadata(
                        &original,
                        labels::extra_file_labels(
                            original.service_name().unwrap_or_default(),
                            &original.name_any(),
                            &file.name,
                        ),
                    )
                    .context(error::BuildMetadataSnafu { name: &file.name })?;
                    metadata.generate_name =
                        Some(labels::extra_files_generate_name(&original.name_any()));
                    let config_map = ConfigMap {
                        metadata,
                        binary_data: Some(file_data(file)),
                        ..Default::default()
                    };
                    self.client
                        .create(&config_map)
                        .await
                        .context(error::WriteConfigMapSnafu { name: &file.name })?
                }
            };
            tracing::info!(
                config_map = %ObjectRef::from_obj(&written),
                file = %file.name,
                "wrote extra file"
            );
            target.spec.files.insert(
                file.name.clone(),
                ConfigMapKeyRef {
                    name: written.name_any(),
                    key: file.name.clone(),
                    optional: false,
                },
            );
        }
        bump_last_update(&mut target)?;
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }
}
