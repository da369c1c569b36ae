//! Static TLS certificates, kept in one content-addressed Secret per instance

use std::collections::BTreeMap;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{runtime::reflector::ObjectRef, ResourceExt},
};

use super::{child_metadata, namespace_of, GetInstanceError, InstanceManager};
use crate::{
    crd::{RpaasInstance, TlsSecret, TlsSecretItem},
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway},
    labels,
    tls, validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid certificate name"))]
    Validation { source: validation::Error },

    #[snafu(display("invalid certificate {name:?}"))]
    InvalidCertificate { source: tls::Error, name: String },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display(
        "certificate DNS name {dns_name:?} is already used by certificate {certificate:?}"
    ))]
    DuplicateDnsName {
        dns_name: String,
        certificate: String,
    },

    #[snafu(display("certificate {name:?} already deployed"))]
    AlreadyDeployed { name: String },

    #[snafu(display("certificate {name:?} not found"))]
    NotFound { name: String },

    #[snafu(display("failed to load certificate Secret {secret:?}"))]
    GetSecret {
        source: gateway::Error,
        secret: String,
    },

    #[snafu(display("failed to build metadata for certificate Secret"))]
    BuildMetadata {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to create certificate Secret {secret:?}"))]
    CreateSecret {
        source: gateway::Error,
        secret: String,
    },

    #[snafu(display("failed to delete certificate Secret {secret:?}"))]
    DeleteSecret {
        source: gateway::Error,
        secret: String,
    },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } | Error::DuplicateDnsName { .. } => ErrorKind::Validation,
            Error::InvalidCertificate { source, .. } => source.kind(),
            Error::GetInstance { source } => source.kind(),
            Error::AlreadyDeployed { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::GetSecret { source, .. }
            | Error::CreateSecret { source, .. }
            | Error::DeleteSecret { source, .. }
            | Error::PatchInstance { source } => source.kind(),
            Error::BuildMetadata { .. } => ErrorKind::Internal,
        }
    }
}

/// One certificate entry, PEM-encoded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateData {
    pub name: String,
    pub certificate: String,
    pub key: String,
}

fn certificate_field(name: &str) -> String {
    format!("{name}.crt")
}

fn key_field(name: &str) -> String {
    format!("{name}.key")
}

fn entry_name(item: &TlsSecretItem) -> &str {
    item.certificate_field
        .strip_suffix(".crt")
        .unwrap_or(&item.certificate_field)
}

impl<G: Gateway> InstanceManager<G> {
    /// Adds or replaces the certificate entry `name`, blank names select `default`
    pub async fn update_certificate(
        &self,
        instance_name: &str,
        name: &str,
        certificate_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<(), Error> {
        let name = validation::certificate_name(name).context(error::ValidationSnafu)?;
        let key_pair = tls::KeyPair::parse(certificate_pem, key_pem)
            .context(error::InvalidCertificateSnafu { name: &name })?;

        let original = self
            .get_instance(instance_name)
            .await
            .context(error::GetInstanceSnafu)?;
        let data = self.certificate_data(&original).await?;
        let items = original
            .spec
            .certificates
            .as_ref()
            .map(|certificates| certificates.items.clone())
            .unwrap_or_default();

        let dns_names = key_pair
            .chain
            .iter()
            .flat_map(|certificate| tls::dns_names(certificate))
            .collect::<Vec<_>>();
        for item in items.iter().filter(|item| entry_name(item) != name) {
            let Some(pem) = data.get(&item.certificate_field) else {
                continue;
            };
            let Ok(chain) = tls::parse_certificate_chain(pem) else {
                tracing::warn!(certificate = entry_name(item), "ignoring unparsable certificate");
                continue;
            };
            for certificate in &chain {
                if let Some(dns_name) = tls::dns_names(certificate)
                    .into_iter()
                    .find(|dns_name| dns_names.contains(dns_name))
                {
                    return error::DuplicateDnsNameSnafu {
                        dns_name,
                        certificate: entry_name(item),
                    }
                    .fail();
                }
            }
        }

        let mut new_data = data.clone();
        new_data.insert(certificate_field(&name), certificate_pem.to_vec());
        new_data.insert(key_field(&name), key_pem.to_vec());
        ensure!(new_data != data, error::AlreadyDeployedSnafu { name: &name });

        let mut items = items;
        if !items.iter().any(|item| entry_name(item) == name) {
            items.push(TlsSecretItem {
                certificate_field: certificate_field(&name),
                certificate_path: Some(certificate_field(&name)),
                key_field: key_field(&name),
                key_path: Some(key_field(&name)),
            });
        }
        let secret_name = self.write_certificate_secret(&original, new_data).await?;

        let mut target = original.clone();
        target.spec.certificates = Some(TlsSecret { secret_name, items });
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn delete_certificate(&self, instance_name: &str, name: &str) -> Result<(), Error> {
        let name = validation::certificate_name(name).context(error::ValidationSnafu)?;
        let original = self
            .get_instance(instance_name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut items = original
            .spec
            .certificates
            .as_ref()
            .map(|certificates| certificates.items.clone())
            .unwrap_or_default();
        let index = items
            .iter()
            .position(|item| entry_name(item) == name)
            .context(error::NotFoundSnafu { name: &name })?;
        let removed = items.remove(index);

        let mut data = self.certificate_data(&original).await?;
        data.remove(&removed.certificate_field);
        data.remove(&removed.key_field);

        let mut target = original.clone();
        if items.is_empty() {
            target.spec.certificates = None;
        } else {
            let secret_name = self.write_certificate_secret(&original, data).await?;
            target.spec.certificates = Some(TlsSecret { secret_name, items });
        }
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;

        if target.spec.certificates.is_none() {
            if let Some(secret) = self.certificate_secret(&original).await? {
                match self.client.delete(&secret).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(source) => {
                        return Err(Error::DeleteSecret {
                            source,
                            secret: secret.name_any(),
                        })
                    }
                }
                tracing::info!(secret = %ObjectRef::from_obj(&secret), "deleted certificate secret");
            }
        }
        Ok(())
    }

    /// Certificate entries in the order the instance lists them
    pub async fn get_certificates(&self, instance_name: &str) -> Result<Vec<CertificateData>, Error> {
        let instance = self
            .get_instance(instance_name)
            .await
            .context(error::GetInstanceSnafu)?;
        let data = self.certificate_data(&instance).await?;
        let items = instance
            .spec
            .certificates
            .map(|certificates| certificates.items)
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                let certificate = data.get(&item.certificate_field)?;
                let key = data.get(&item.key_field)?;
                Some(CertificateData {
                    name: entry_name(item).to_string(),
                    certificate: String::from_utf8_lossy(certificate).into_owned(),
                    key: String::from_utf8_lossy(key).into_owned(),
                })
            })
            .collect())
    }

    pub(super) async fn certificate_secret(
        &self,
        instance: &RpaasInstance,
    ) -> Result<Option<Secret>, Error> {
        let Some(certificates) = &instance.spec.certificates else {
            return Ok(None);
        };
        self.client
            .get_opt::<Secret>(&namespace_of(instance), &certificates.secret_name)
            .await
            .context(error::GetSecretSnafu {
                secret: &certificates.secret_name,
            })
    }

    /// Data of the current certificate Secret, empty when there is none
    pub(super) async fn certificate_data(
        &self,
        instance: &RpaasInstance,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        Ok(self
            .certificate_secret(instance)
            .await?
            .and_then(|secret| secret.data)
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect())
    }

    /// Parsed metadata of every entry, leaving out entries that fail to parse
    pub(super) async fn certificate_infos(
        &self,
        instance: &RpaasInstance,
    ) -> Result<Vec<tls::CertificateInfo>, Error> {
        let data = self.certificate_data(instance).await?;
        let items = instance
            .spec
            .certificates
            .iter()
            .flat_map(|certificates| &certificates.items);
        Ok(items
            .filter_map(|item| {
                let pem = data.get(&item.certificate_field)?;
                match tls::CertificateInfo::from_pem(entry_name(item), pem) {
                    Ok(info) => Some(info),
                    Err(err) => {
                        tracing::warn!(
                            certificate = entry_name(item),
                            error = &err as &dyn std::error::Error,
                            "ignoring unparsable certificate"
                        );
                        None
                    }
                }
            })
            .collect())
    }

    /// Creates the Secret named after the hash of `data`, reusing it if it already exists
    async fn write_certificate_secret(
        &self,
        instance: &RpaasInstance,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<String, Error> {
        let secret_name = labels::certificate_secret_name(&instance.name_any(), &data);
        let mut metadata =
            child_metadata(instance, BTreeMap::new()).context(error::BuildMetadataSnafu)?;
        metadata.name = Some(secret_name.clone());
        metadata.annotations = Some(BTreeMap::from([(
            labels::ANNOTATION_SHA256_HASH.to_string(),
            labels::content_hash(&data),
        )]));
        let secret = Secret {
            metadata,
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Default::default()
        };
        match self.client.create(&secret).await {
            Ok(created) => {
                tracing::info!(secret = %ObjectRef::from_obj(&created), "created certificate secret")
            }
            Err(err) if err.is_already_exists() => {
                tracing::debug!(secret = %secret_name, "certificate secret already exists")
            }
            Err(source) => {
                return Err(Error::CreateSecret {
                    source,
                    secret: secret_name,
                })
            }
        }
        Ok(secret_name)
    }
}
