//! PEM certificate and private key parsing

use openssl::{
    asn1::{Asn1Time, Asn1TimeRef, TimeDiff},
    pkey::{Id, PKey, Private},
    x509::{X509Ref, X509},
};
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;
use time::OffsetDateTime;

use crate::error::{ErrorKind, ManagerError};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("no certificate found in PEM data"))]
    NoCertificate,

    #[snafu(display("failed to parse certificate"))]
    ParseCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to parse private key"))]
    ParsePrivateKey { source: openssl::error::ErrorStack },

    #[snafu(display("unsupported private key type, only RSA and ECDSA keys are accepted"))]
    UnsupportedKeyType,

    #[snafu(display("private key does not match the certificate public key"))]
    KeyMismatch,

    #[snafu(display("failed to read certificate public key"))]
    ReadPublicKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read certificate validity"))]
    ReadValidity { source: ValidityError },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ValidityError {
    #[snafu(display("failed to build the unix epoch"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("failed to measure time since the unix epoch"))]
    SinceEpoch { source: openssl::error::ErrorStack },

    #[snafu(display("validity date is out of range"))]
    OutOfRange,
}

/// Converts a certificate validity bound into an [`OffsetDateTime`]
pub fn validity_date(asn: &Asn1TimeRef) -> Result<OffsetDateTime, ValidityError> {
    let epoch = Asn1Time::from_unix(0).context(validity_error::EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(validity_error::SinceEpochSnafu)?;
    let since_epoch = time::Duration::days(days.into()) + time::Duration::seconds(secs.into());
    OffsetDateTime::UNIX_EPOCH
        .checked_add(since_epoch)
        .context(validity_error::OutOfRangeSnafu)
}

/// Parses every certificate of a PEM chain, leaf first
pub fn parse_certificate_chain(pem: &[u8]) -> Result<Vec<X509>, Error> {
    let chain = X509::stack_from_pem(pem).context(error::ParseCertificateSnafu)?;
    if chain.is_empty() {
        return error::NoCertificateSnafu.fail();
    }
    Ok(chain)
}

/// Parses an RSA or ECDSA private key
pub fn parse_private_key(pem: &[u8]) -> Result<PKey<Private>, Error> {
    let key = PKey::private_key_from_pem(pem).context(error::ParsePrivateKeySnafu)?;
    match key.id() {
        Id::RSA | Id::EC => Ok(key),
        _ => error::UnsupportedKeyTypeSnafu.fail(),
    }
}

/// A certificate chain together with the private key of its leaf
#[derive(Debug)]
pub struct KeyPair {
    pub chain: Vec<X509>,
    pub key: PKey<Private>,
}

impl KeyPair {
    pub fn parse(certificate_pem: &[u8], key_pem: &[u8]) -> Result<Self, Error> {
        let chain = parse_certificate_chain(certificate_pem)?;
        let key = parse_private_key(key_pem)?;
        let leaf_key = chain[0].public_key().context(error::ReadPublicKeySnafu)?;
        if !leaf_key.public_eq(&key) {
            return error::KeyMismatchSnafu.fail();
        }
        Ok(Self { chain, key })
    }

    pub fn leaf(&self) -> &X509Ref {
        &self.chain[0]
    }
}

/// DNS subject alternative names of `certificate`
pub fn dns_names(certificate: &X509Ref) -> Vec<String> {
    certificate
        .subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum PublicKeyAlgorithm {
    #[serde(rename = "RSA")]
    #[strum(serialize = "RSA")]
    Rsa,
    #[serde(rename = "ECDSA")]
    #[strum(serialize = "ECDSA")]
    Ecdsa,
    #[serde(rename = "unknown")]
    #[strum(serialize = "unknown")]
    Unknown,
}

/// Metadata of one certificate entry
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_until: OffsetDateTime,
    pub dns_names: Vec<String>,
    pub public_key_algorithm: PublicKeyAlgorithm,
    pub public_key_bit_size: u32,
}

impl CertificateInfo {
    /// Describes the leaf of the PEM chain `certificate_pem`
    pub fn from_pem(name: &str, certificate_pem: &[u8]) -> Result<Self, Error> {
        let chain = parse_certificate_chain(certificate_pem)?;
        Self::from_x509(name, &chain[0])
    }

    pub fn from_x509(name: &str, certificate: &X509Ref) -> Result<Self, Error> {
        let public_key = certificate
            .public_key()
            .context(error::ReadPublicKeySnafu)?;
        let public_key_algorithm = match public_key.id() {
            Id::RSA => PublicKeyAlgorithm::Rsa,
            Id::EC => PublicKeyAlgorithm::Ecdsa,
            _ => PublicKeyAlgorithm::Unknown,
        };
        Ok(Self {
            name: name.to_string(),
            valid_from: validity_date(certificate.not_before())
                .context(error::ReadValiditySnafu)?,
            valid_until: validity_date(certificate.not_after())
                .context(error::ReadValiditySnafu)?,
            dns_names: dns_names(certificate),
            public_key_algorithm,
            public_key_bit_size: public_key.bits(),
        })
    }
}
