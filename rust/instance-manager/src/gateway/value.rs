//! Resolution of inline-or-referenced [`Value`]s

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::k8s_openapi::api::core::v1::ConfigMap;

use super::Gateway;
use crate::{
    crd::Value,
    error::{ErrorKind, ManagerError},
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("failed to load ConfigMap {name:?}"))]
    GetConfigMap {
        source: super::Error,
        name: String,
    },

    #[snafu(display("key {key:?} not found in ConfigMap {name:?}"))]
    MissingKey { name: String, key: String },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::GetConfigMap { source, .. } => source.kind(),
            Error::MissingKey { .. } => ErrorKind::NotFound,
        }
    }
}

/// Content of `value`, reading referenced ConfigMaps from `namespace`.
///
/// Missing optional references resolve to [`None`].
pub async fn resolve(
    gateway: &impl Gateway,
    namespace: &str,
    value: &Value,
) -> Result<Option<String>, Error> {
    let key_ref = match value {
        Value::Inline(content) => return Ok(Some(content.clone())),
        Value::ConfigMapKeyRef(key_ref) => key_ref,
    };
    let config_map = gateway
        .get_opt::<ConfigMap>(namespace, &key_ref.name)
        .await
        .context(error::GetConfigMapSnafu {
            name: &key_ref.name,
        })?;
    let content = config_map.and_then(|cm| cm.data?.remove(&key_ref.key));
    if key_ref.optional {
        Ok(content)
    } else {
        content
            .context(error::MissingKeySnafu {
                name: &key_ref.name,
                key: &key_ref.key,
            })
            .map(Some)
    }
}
