//! Certificates issued by cert-manager on behalf of an instance

use snafu::{ensure, ResultExt, Snafu};
use stackable_operator::kube::ResourceExt;

use super::{namespace_of, GetInstanceError, InstanceManager};
use crate::{
    crd::{CertManager, DynamicCertificates, RpaasInstance},
    error::{ErrorKind, ManagerError},
    external_crd::cert_manager::{ClusterIssuer, Issuer},
    gateway::{self, Gateway},
    labels, validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("cert-manager integration is not enabled"))]
    Disabled,

    #[snafu(display("invalid cert-manager request"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("failed to look up issuer {issuer:?}"))]
    GetIssuer {
        source: gateway::Error,
        issuer: String,
    },

    #[snafu(display("there is no Issuer or ClusterIssuer named {issuer:?}"))]
    IssuerNotFound { issuer: String },

    #[snafu(display("cert-manager request for issuer {issuer:?} not found"))]
    NotFound { issuer: String },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Disabled => ErrorKind::Conflict,
            Error::Validation { .. } | Error::IssuerNotFound { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::GetIssuer { source, .. } | Error::PatchInstance { source } => source.kind(),
        }
    }
}

/// Drops the dynamic certificates block once nothing is left in it
fn normalize(instance: &mut RpaasInstance) {
    if instance
        .spec
        .dynamic_certificates
        .as_ref()
        .is_some_and(DynamicCertificates::is_empty)
    {
        instance.spec.dynamic_certificates = None;
    }
}

impl<G: Gateway> InstanceManager<G> {
    /// Adds a request, or overwrites the one with the same issuer
    pub async fn update_cert_manager_request(
        &self,
        name: &str,
        request: CertManager,
    ) -> Result<(), Error> {
        let opts = self.options();
        ensure!(opts.enable_cert_manager, error::DisabledSnafu);
        let mut request = request;
        if request.issuer.is_empty() {
            request.issuer = opts.default_cert_manager_issuer.clone().unwrap_or_default();
        }
        validation::cert_manager_request(&request).context(error::ValidationSnafu)?;

        let original = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;
        let allowed_zones = self
            .issuer_allowed_zones(&namespace_of(&original), &request.issuer)
            .await?;
        if let Some(allowed_zones) = allowed_zones.filter(|zones| !zones.trim().is_empty()) {
            validation::dns_zones(&request.dns_names, &allowed_zones)
                .context(error::ValidationSnafu)?;
        }

        let mut target = original.clone();
        let dynamic = target
            .spec
            .dynamic_certificates
            .get_or_insert_with(DynamicCertificates::default);
        if dynamic
            .cert_manager
            .as_ref()
            .is_some_and(|legacy| legacy.issuer == request.issuer)
        {
            dynamic.cert_manager = None;
        }
        match dynamic
            .cert_manager_requests
            .iter_mut()
            .find(|existing| existing.issuer == request.issuer)
        {
            Some(existing) => *existing = request,
            None => dynamic.cert_manager_requests.push(request),
        }
        normalize(&mut target);

        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Removes the request of `issuer`, the single legacy request is matched first
    pub async fn delete_cert_manager_request(&self, name: &str, issuer: &str) -> Result<(), Error> {
        let opts = self.options();
        let issuer = match issuer.trim() {
            "" => opts.default_cert_manager_issuer.clone().unwrap_or_default(),
            issuer => issuer.to_string(),
        };
        let original = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;

        let mut target = original.clone();
        let dynamic = target
            .spec
            .dynamic_certificates
            .get_or_insert_with(DynamicCertificates::default);
        if dynamic
            .cert_manager
            .as_ref()
            .is_some_and(|legacy| legacy.issuer == issuer)
        {
            dynamic.cert_manager = None;
        } else {
            let index = dynamic
                .cert_manager_requests
                .iter()
                .position(|request| request.issuer == issuer);
            match index {
                Some(index) => {
                    dynamic.cert_manager_requests.remove(index);
                }
                None => return error::NotFoundSnafu { issuer }.fail(),
            }
        }
        normalize(&mut target);

        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// The legacy request, if any, followed by the listed ones
    pub async fn get_cert_manager_requests(&self, name: &str) -> Result<Vec<CertManager>, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        Ok(cert_manager_requests(&instance))
    }

    /// Allowed DNS zones annotated on the namespaced Issuer or, failing that, the ClusterIssuer
    async fn issuer_allowed_zones(
        &self,
        namespace: &str,
        issuer: &str,
    ) -> Result<Option<String>, Error> {
        let annotations = match self
            .client
            .get_opt::<Issuer>(namespace, issuer)
            .await
            .context(error::GetIssuerSnafu { issuer })?
        {
            Some(found) => found.annotations().clone(),
            None => self
                .client
                .get_opt::<ClusterIssuer>(namespace, issuer)
                .await
                .context(error::GetIssuerSnafu { issuer })?
                .ok_or_else(|| error::IssuerNotFoundSnafu { issuer }.build())?
                .annotations()
                .clone(),
        };
        Ok(annotations
            .get(labels::ANNOTATION_ALLOWED_DNS_ZONES)
            .cloned())
    }
}

pub(super) fn cert_manager_requests(instance: &RpaasInstance) -> Vec<CertManager> {
    instance
        .spec
        .dynamic_certificates
        .as_ref()
        .map(|dynamic| {
            dynamic
                .cert_manager
                .iter()
                .chain(&dynamic.cert_manager_requests)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}
