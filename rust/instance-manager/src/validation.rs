//! Pure input checks shared by the mutators
//!
//! Every failure here is a [`ErrorKind::Validation`] error.

use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;
use snafu::{ensure, Snafu};

use crate::{
    config::DenyPattern,
    crd::{AutoscaleSpec, CertManager, LoadBalance, Location, TrafficShapingPolicy, UpstreamOptions, Value},
    error::{ErrorKind, ManagerError},
    labels,
};

/// Maximum size of a single extra file
pub const MAX_FILE_SIZE: usize = 1 << 20;

/// Certificate name used when none is given
pub const DEFAULT_CERTIFICATE_NAME: &str = "default";

const RESERVED_CERTIFICATE_NAMES: &[&str] = &["cert-manager"];

const MAX_CERT_MANAGER_NAME_LEN: usize = 27;
const MAX_DNS_NAME_LEN: usize = 64;

static INSTANCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("instance name regex must compile")
});
static FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][^/ ]+$").expect("file name regex must compile")
});
static CONFIG_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-._a-zA-Z0-9]+$").expect("config key regex must compile")
});

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "instance name must be at most {} characters long",
        labels::MAX_INSTANCE_NAME_LEN
    ))]
    InstanceNameTooLong,

    #[snafu(display(
        "instance name {name:?} must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character"
    ))]
    InvalidInstanceName { name: String },

    #[snafu(display("team name is required"))]
    MissingTeam,

    #[snafu(display("file name {name:?} is invalid, it must match {}", FILE_NAME.as_str()))]
    InvalidFileName { name: String },

    #[snafu(display("file {name:?} is empty"))]
    EmptyFile { name: String },

    #[snafu(display("file {name:?} exceeds the maximum size of {MAX_FILE_SIZE} bytes"))]
    FileTooLarge { name: String },

    #[snafu(display("content matches the forbidden pattern {pattern:?}"))]
    ForbiddenContent { pattern: String },

    #[snafu(display("path is required"))]
    MissingPath,

    #[snafu(display("path {path:?} must start with '/' and contain no whitespace"))]
    InvalidPath { path: String },

    #[snafu(display("exactly one of destination or content must be set"))]
    DestinationXorContent,

    #[snafu(display("cannot force https without a destination"))]
    HttpsWithoutDestination,

    #[snafu(display("certificate name {name:?} is reserved"))]
    ReservedCertificateName { name: String },

    #[snafu(display("certificate name {name:?} is invalid, it must match {}", CONFIG_KEY.as_str()))]
    InvalidCertificateName { name: String },

    #[snafu(display("cert-manager issuer is required"))]
    MissingIssuer,

    #[snafu(display("at least one DNS name or IP address is required"))]
    NoCertificateSubjects,

    #[snafu(display(
        "certificate name {name:?} must be at most {MAX_CERT_MANAGER_NAME_LEN} characters long"
    ))]
    CertificateNameTooLong { name: String },

    #[snafu(display("DNS name {dns_name:?} must be at most {MAX_DNS_NAME_LEN} characters long"))]
    DnsNameTooLong { dns_name: String },

    #[snafu(display(
        "there are DNS names with forbidden suffixes (invalid ones: {}), allowed zones are {allowed_zones}",
        dns_names.join(", ")
    ))]
    ForbiddenDnsNames {
        dns_names: Vec<String>,
        allowed_zones: String,
    },

    #[snafu(display("maxReplicas must be at least 1"))]
    MaxReplicasTooLow,

    #[snafu(display("minReplicas ({min}) must not exceed maxReplicas ({max})"))]
    MinAboveMax { min: i32, max: i32 },

    #[snafu(display("replicas must not be negative"))]
    NegativeReplicas,

    #[snafu(display("host is required"))]
    MissingHost,

    #[snafu(display("app name is required"))]
    MissingAppName,

    #[snafu(display("bind host {host:?} uses an unsupported scheme"))]
    UnsupportedBindScheme { host: String },

    #[snafu(display("key {key:?} is reserved"))]
    ReservedKey { key: String },

    #[snafu(display("primary bind is required"))]
    MissingPrimaryBind,

    #[snafu(display("bind {bind:?} is not bound to the instance"))]
    UnknownBind { bind: String },

    #[snafu(display("only one canary bind is allowed per upstream"))]
    TooManyCanaries,

    #[snafu(display("bind {bind:?} cannot be a canary of itself"))]
    SelfCanary { bind: String },

    #[snafu(display(
        "canary bind {canary:?} must have its own upstream options before being used as canary"
    ))]
    CanaryWithoutOptions { canary: String },

    #[snafu(display(
        "bind {bind:?} cannot be used as canary because it has its own canary binds"
    ))]
    CanaryHasCanaries { bind: String },

    #[snafu(display("bind {bind:?} cannot have canary binds because it is a canary of {primary:?}"))]
    CanaryCannotHaveCanaries { bind: String, primary: String },

    #[snafu(display("bind {bind:?} is already a canary of {primary:?}"))]
    DuplicateCanary { bind: String, primary: String },

    #[snafu(display(
        "upstream {bind:?} has canary binds, set the traffic shaping policy on the canary instead"
    ))]
    TrafficShapingOnPrimary { bind: String },

    #[snafu(display("only one canary of {primary:?} may receive weighted traffic"))]
    MultipleWeightedCanaries { primary: String },

    #[snafu(display("weight must not be negative"))]
    NegativeWeight,

    #[snafu(display("weight total must not be negative"))]
    NegativeWeightTotal,

    #[snafu(display("headerValue and headerPattern are mutually exclusive"))]
    HeaderValueAndPattern,

    #[snafu(display("header {header:?} requires either headerValue or headerPattern"))]
    HeaderWithoutMatcher { header: String },

    #[snafu(display("loadBalanceHashKey is required when loadBalance is chash"))]
    MissingHashKey,

    #[snafu(display("loadBalanceHashKey is only allowed when loadBalance is chash"))]
    UnexpectedHashKey,
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

pub fn instance_name(name: &str) -> Result<(), Error> {
    ensure!(
        name.len() <= labels::MAX_INSTANCE_NAME_LEN,
        InstanceNameTooLongSnafu
    );
    ensure!(INSTANCE_NAME.is_match(name), InvalidInstanceNameSnafu { name });
    Ok(())
}

pub fn team(team: &str) -> Result<(), Error> {
    ensure!(!team.trim().is_empty(), MissingTeamSnafu);
    Ok(())
}

pub fn file_name(name: &str) -> Result<(), Error> {
    ensure!(FILE_NAME.is_match(name), InvalidFileNameSnafu { name });
    Ok(())
}

pub fn file(name: &str, content: &[u8]) -> Result<(), Error> {
    file_name(name)?;
    ensure!(!content.is_empty(), EmptyFileSnafu { name });
    ensure!(content.len() <= MAX_FILE_SIZE, FileTooLargeSnafu { name });
    Ok(())
}

/// Rejects `content` if any deny pattern matches it
pub fn content(content: &str, deny_patterns: &[DenyPattern]) -> Result<(), Error> {
    match deny_patterns
        .iter()
        .find(|pattern| pattern.is_match(content))
    {
        Some(pattern) => ForbiddenContentSnafu {
            pattern: pattern.as_str(),
        }
        .fail(),
        None => Ok(()),
    }
}

fn inline_content(value: Option<&Value>) -> Option<&str> {
    match value {
        Some(Value::Inline(content)) => Some(content),
        _ => None,
    }
}

pub fn route(location: &Location, deny_patterns: &[DenyPattern]) -> Result<(), Error> {
    ensure!(!location.path.is_empty(), MissingPathSnafu);
    ensure!(
        location.path.starts_with('/') && !location.path.contains(char::is_whitespace),
        InvalidPathSnafu {
            path: &location.path
        }
    );
    let has_destination = location
        .destination
        .as_deref()
        .is_some_and(|destination| !destination.is_empty());
    let has_content = match &location.content {
        Some(Value::Inline(content)) => !content.is_empty(),
        Some(Value::ConfigMapKeyRef(_)) => true,
        None => false,
    };
    ensure!(has_destination != has_content, DestinationXorContentSnafu);
    ensure!(
        !location.force_https || has_destination,
        HttpsWithoutDestinationSnafu
    );
    if let Some(inline) = inline_content(location.content.as_ref()) {
        content(inline, deny_patterns)?;
    }
    Ok(())
}

/// Normalised certificate name, [`DEFAULT_CERTIFICATE_NAME`] when blank
pub fn certificate_name(name: &str) -> Result<String, Error> {
    let name = match name.trim() {
        "" => DEFAULT_CERTIFICATE_NAME,
        name => name,
    };
    ensure!(
        !RESERVED_CERTIFICATE_NAMES.contains(&name),
        ReservedCertificateNameSnafu { name }
    );
    ensure!(
        CONFIG_KEY.is_match(name),
        InvalidCertificateNameSnafu { name }
    );
    Ok(name.to_string())
}

/// Shape of a cert-manager request, independent of the issuer
pub fn cert_manager_request(request: &CertManager) -> Result<(), Error> {
    ensure!(!request.issuer.is_empty(), MissingIssuerSnafu);
    ensure!(
        !request.dns_names.is_empty() || !request.ip_addresses.is_empty(),
        NoCertificateSubjectsSnafu
    );
    if let Some(name) = &request.name {
        ensure!(
            name.len() <= MAX_CERT_MANAGER_NAME_LEN,
            CertificateNameTooLongSnafu { name }
        );
    }
    for dns_name in &request.dns_names {
        ensure!(
            dns_name.len() <= MAX_DNS_NAME_LEN,
            DnsNameTooLongSnafu { dns_name }
        );
    }
    Ok(())
}

/// Checks `dns_names` against a comma-separated list of allowed zones
pub fn dns_zones(dns_names: &[String], allowed_zones: &str) -> Result<(), Error> {
    let zones = allowed_zones
        .split(',')
        .map(str::trim)
        .filter(|zone| !zone.is_empty())
        .map(|zone| zone.trim_start_matches('.'))
        .collect::<Vec<_>>();
    let forbidden = dns_names
        .iter()
        .filter(|dns_name| {
            !zones.iter().any(|zone| {
                dns_name.as_str() == *zone
                    || dns_name
                        .strip_suffix(zone)
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
        })
        .cloned()
        .collect::<Vec<_>>();
    ensure!(
        forbidden.is_empty(),
        ForbiddenDnsNamesSnafu {
            dns_names: forbidden,
            allowed_zones,
        }
    );
    Ok(())
}

pub fn autoscale(spec: &AutoscaleSpec) -> Result<(), Error> {
    ensure!(spec.max_replicas >= 1, MaxReplicasTooLowSnafu);
    if let Some(min) = spec.min_replicas {
        ensure!(
            min <= spec.max_replicas,
            MinAboveMaxSnafu {
                min,
                max: spec.max_replicas
            }
        );
    }
    Ok(())
}

pub fn replicas(replicas: i32) -> Result<(), Error> {
    ensure!(replicas >= 0, NegativeReplicasSnafu);
    Ok(())
}

pub fn upstream_host(host: &str) -> Result<(), Error> {
    ensure!(!host.trim().is_empty(), MissingHostSnafu);
    Ok(())
}

pub fn app_name(name: &str) -> Result<(), Error> {
    ensure!(!name.trim().is_empty(), MissingAppNameSnafu);
    Ok(())
}

/// Host to store for a bind: `tcp://` is stripped to `host:port`, `udp://` is rejected
pub fn bind_host(host: &str) -> Result<String, Error> {
    ensure!(!host.trim().is_empty(), MissingHostSnafu);
    if let Some(rest) = host.strip_prefix("tcp://") {
        return Ok(rest.trim_end_matches('/').to_string());
    }
    ensure!(
        !host.starts_with("udp://"),
        UnsupportedBindSchemeSnafu { host }
    );
    Ok(host.to_string())
}

/// Rejects user metadata under the reserved prefix
pub fn metadata_key(key: &str) -> Result<(), Error> {
    ensure!(!labels::is_reserved(key), ReservedKeySnafu { key });
    Ok(())
}

/// Fills in the default `weightTotal` and checks the header matchers
pub fn traffic_shaping_policy(
    mut policy: TrafficShapingPolicy,
) -> Result<TrafficShapingPolicy, Error> {
    ensure!(policy.weight >= 0, NegativeWeightSnafu);
    ensure!(policy.weight_total >= 0, NegativeWeightTotalSnafu);
    if policy.weight > 0 && policy.weight_total == 0 {
        policy.weight_total = if policy.weight <= 100 {
            100
        } else {
            policy.weight * 10
        };
    }
    ensure!(
        !(policy.header_value.is_some() && policy.header_pattern.is_some()),
        HeaderValueAndPatternSnafu
    );
    if let Some(header) = &policy.header {
        ensure!(
            policy.header_value.is_some() || policy.header_pattern.is_some(),
            HeaderWithoutMatcherSnafu { header }
        );
    }
    Ok(policy)
}

/// Per-record checks, returning the record with defaults applied
pub fn upstream_options(
    mut record: UpstreamOptions,
    bind_names: &BTreeSet<&str>,
) -> Result<UpstreamOptions, Error> {
    ensure!(!record.primary_bind.is_empty(), MissingPrimaryBindSnafu);
    ensure!(
        bind_names.contains(record.primary_bind.as_str()),
        UnknownBindSnafu {
            bind: &record.primary_bind
        }
    );
    ensure!(record.canary_binds.len() <= 1, TooManyCanariesSnafu);
    for canary in &record.canary_binds {
        ensure!(
            *canary != record.primary_bind,
            SelfCanarySnafu { bind: canary }
        );
        ensure!(
            bind_names.contains(canary.as_str()),
            UnknownBindSnafu { bind: canary }
        );
    }
    match record.load_balance {
        LoadBalance::Chash => ensure!(
            record
                .load_balance_hash_key
                .as_deref()
                .is_some_and(|key| !key.is_empty()),
            MissingHashKeySnafu
        ),
        LoadBalance::RoundRobin | LoadBalance::Ewma => ensure!(
            record
                .load_balance_hash_key
                .as_deref()
                .map_or(true, str::is_empty),
            UnexpectedHashKeySnafu
        ),
    }
    if record.load_balance_hash_key.as_deref() == Some("") {
        record.load_balance_hash_key = None;
    }
    record.traffic_shaping_policy = traffic_shaping_policy(record.traffic_shaping_policy)?;
    Ok(record)
}

/// Cross-record checks of the canary graph after upserting `changed`
pub fn upstream_graph(records: &[UpstreamOptions], changed: &str) -> Result<(), Error> {
    let record_of = |bind: &str| records.iter().find(|record| record.primary_bind == bind);
    let primary_of = |bind: &str| {
        records
            .iter()
            .find(|record| record.canary_binds.iter().any(|canary| canary == bind))
    };

    if let Some(record) = record_of(changed) {
        if !record.canary_binds.is_empty() {
            ensure!(
                record.traffic_shaping_policy.is_empty(),
                TrafficShapingOnPrimarySnafu { bind: changed }
            );
            if let Some(primary) = primary_of(changed) {
                return CanaryCannotHaveCanariesSnafu {
                    bind: changed,
                    primary: &primary.primary_bind,
                }
                .fail();
            }
        }
        for canary in &record.canary_binds {
            let canary_record =
                record_of(canary).ok_or_else(|| CanaryWithoutOptionsSnafu { canary }.build())?;
            ensure!(
                canary_record.canary_binds.is_empty(),
                CanaryHasCanariesSnafu { bind: canary }
            );
            if let Some(other) = records.iter().find(|other| {
                other.primary_bind != changed && other.canary_binds.contains(canary)
            }) {
                return DuplicateCanarySnafu {
                    bind: canary,
                    primary: &other.primary_bind,
                }
                .fail();
            }
        }
    }

    for record in records {
        let weighted = record
            .canary_binds
            .iter()
            .filter_map(|canary| record_of(canary))
            .filter(|canary| canary.traffic_shaping_policy.weight > 0)
            .count();
        ensure!(
            weighted <= 1,
            MultipleWeightedCanariesSnafu {
                primary: &record.primary_bind
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::crd::ConfigMapKeyRef;

    fn deny(patterns: &[&str]) -> Vec<DenyPattern> {
        patterns
            .iter()
            .map(|pattern| DenyPattern::try_from(pattern.to_string()).unwrap())
            .collect()
    }

    #[test]
    fn instance_names() {
        assert!(instance_name("my-instance").is_ok());
        assert!(instance_name(&"a".repeat(30)).is_ok());
        assert_eq!(
            instance_name(&"a".repeat(31)),
            Err(Error::InstanceNameTooLong)
        );
        assert!(instance_name("My_Instance").is_err());
        assert!(instance_name("-leading").is_err());
        assert!(instance_name("").is_err());
    }

    #[test]
    fn files() {
        assert!(file("index.html", b"<h1>hi</h1>").is_ok());
        assert!(matches!(
            file("", b"x"),
            Err(Error::InvalidFileName { .. })
        ));
        assert!(file("dir/index.html", b"x").is_err());
        assert!(file(".hidden", b"x").is_err());
        assert!(matches!(file("empty.txt", b""), Err(Error::EmptyFile { .. })));
        assert!(file("max.bin", &vec![0; MAX_FILE_SIZE]).is_ok());
        assert!(matches!(
            file("big.bin", &vec![0; MAX_FILE_SIZE + 1]),
            Err(Error::FileTooLarge { .. })
        ));
    }

    #[test]
    fn routes() {
        let patterns = deny(&["lua_shared_dict"]);
        let destination = Location {
            path: "/app".to_string(),
            destination: Some("app.tsuru.example.com".to_string()),
            force_https: true,
            content: None,
        };
        assert!(route(&destination, &patterns).is_ok());

        let both = Location {
            content: Some(Value::Inline("return 200;".to_string())),
            ..destination.clone()
        };
        assert_eq!(route(&both, &patterns), Err(Error::DestinationXorContent));

        let neither = Location {
            destination: None,
            force_https: false,
            ..destination.clone()
        };
        assert_eq!(route(&neither, &patterns), Err(Error::DestinationXorContent));

        let https_content = Location {
            path: "/app".to_string(),
            force_https: true,
            content: Some(Value::ConfigMapKeyRef(ConfigMapKeyRef {
                name: "routes".to_string(),
                key: "app".to_string(),
                optional: false,
            })),
            ..Default::default()
        };
        assert_eq!(
            route(&https_content, &patterns),
            Err(Error::HttpsWithoutDestination)
        );

        let forbidden = Location {
            path: "/lua".to_string(),
            content: Some(Value::Inline("lua_shared_dict cache 10m;".to_string())),
            ..Default::default()
        };
        let err = route(&forbidden, &patterns).unwrap_err();
        assert_eq!(
            err,
            Error::ForbiddenContent {
                pattern: "lua_shared_dict".to_string()
            }
        );
        assert!(err.to_string().contains("lua_shared_dict"));

        for path in ["", "app", "/my app"] {
            let location = Location {
                path: path.to_string(),
                ..destination.clone()
            };
            assert!(route(&location, &patterns).is_err(), "{path:?}");
        }
    }

    #[test]
    fn certificate_names() {
        assert_eq!(certificate_name("").unwrap(), "default");
        assert_eq!(certificate_name("www.example_1-a").unwrap(), "www.example_1-a");
        assert!(matches!(
            certificate_name("cert-manager"),
            Err(Error::ReservedCertificateName { .. })
        ));
        assert!(certificate_name("my/cert").is_err());
    }

    #[test]
    fn cert_manager_requests() {
        let request = CertManager {
            issuer: "issuer-1".to_string(),
            dns_names: vec!["www.example.com".to_string()],
            ..Default::default()
        };
        assert!(cert_manager_request(&request).is_ok());
        assert_eq!(
            cert_manager_request(&CertManager {
                dns_names: vec![],
                ..request.clone()
            }),
            Err(Error::NoCertificateSubjects)
        );
        assert!(cert_manager_request(&CertManager {
            dns_names: vec![],
            ip_addresses: vec!["10.0.0.1".to_string()],
            ..request.clone()
        })
        .is_ok());
        assert!(cert_manager_request(&CertManager {
            name: Some("a".repeat(28)),
            ..request.clone()
        })
        .is_err());
        assert!(cert_manager_request(&CertManager {
            dns_names: vec![format!("{}.example.com", "a".repeat(60))],
            ..request
        })
        .is_err());
    }

    #[test]
    fn allowed_dns_zones() {
        let zones = "example.com,example.org";
        assert!(dns_zones(&["www.example.com".to_string(), "example.org".to_string()], zones).is_ok());
        let err = dns_zones(
            &["wrong.io".to_string(), "notexample.com".to_string()],
            zones,
        )
        .unwrap_err();
        assert!(err.to_string().contains("wrong.io"));
        assert!(err.to_string().contains("notexample.com"));
    }

    #[test]
    fn autoscale_bounds() {
        let spec = AutoscaleSpec {
            max_replicas: 0,
            ..Default::default()
        };
        assert_eq!(autoscale(&spec), Err(Error::MaxReplicasTooLow));
        let spec = AutoscaleSpec {
            max_replicas: 3,
            min_replicas: Some(5),
            ..Default::default()
        };
        assert!(matches!(autoscale(&spec), Err(Error::MinAboveMax { .. })));
        assert!(replicas(-1).is_err());
        assert!(replicas(0).is_ok());
    }

    #[test]
    fn bind_hosts() {
        assert_eq!(bind_host("tcp://10.0.0.1:8080").unwrap(), "10.0.0.1:8080");
        assert_eq!(bind_host("app.example.com").unwrap(), "app.example.com");
        assert!(matches!(
            bind_host("udp://10.0.0.1:53"),
            Err(Error::UnsupportedBindScheme { .. })
        ));
    }

    #[test]
    fn traffic_shaping_defaults() {
        let weighted = |weight, weight_total| TrafficShapingPolicy {
            weight,
            weight_total,
            ..Default::default()
        };
        assert_eq!(traffic_shaping_policy(weighted(10, 0)).unwrap().weight_total, 100);
        assert_eq!(traffic_shaping_policy(weighted(100, 0)).unwrap().weight_total, 100);
        assert_eq!(traffic_shaping_policy(weighted(150, 0)).unwrap().weight_total, 1500);
        assert_eq!(traffic_shaping_policy(weighted(150, 200)).unwrap().weight_total, 200);

        let both = TrafficShapingPolicy {
            header: Some("X-Canary".to_string()),
            header_value: Some("yes".to_string()),
            header_pattern: Some("y.*".to_string()),
            ..Default::default()
        };
        assert_eq!(
            traffic_shaping_policy(both),
            Err(Error::HeaderValueAndPattern)
        );
        let neither = TrafficShapingPolicy {
            header: Some("X-Canary".to_string()),
            ..Default::default()
        };
        assert!(traffic_shaping_policy(neither).is_err());
    }

    fn record(primary: &str, canaries: &[&str], weight: i32) -> UpstreamOptions {
        UpstreamOptions {
            primary_bind: primary.to_string(),
            canary_binds: canaries.iter().map(|c| c.to_string()).collect(),
            traffic_shaping_policy: TrafficShapingPolicy {
                weight,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn upstream_records() {
        let binds = BTreeSet::from(["app1", "app2", "app3"]);
        assert!(upstream_options(record("app1", &["app2"], 0), &binds).is_ok());
        assert!(matches!(
            upstream_options(record("app9", &[], 0), &binds),
            Err(Error::UnknownBind { .. })
        ));
        assert_eq!(
            upstream_options(record("app1", &["app2", "app3"], 0), &binds),
            Err(Error::TooManyCanaries)
        );
        assert!(upstream_options(record("app1", &["app1"], 0), &binds).is_err());

        let chash = UpstreamOptions {
            load_balance: LoadBalance::Chash,
            ..record("app1", &[], 0)
        };
        assert_eq!(
            upstream_options(chash.clone(), &binds),
            Err(Error::MissingHashKey)
        );
        assert!(upstream_options(
            UpstreamOptions {
                load_balance_hash_key: Some("$remote_addr".to_string()),
                ..chash
            },
            &binds
        )
        .is_ok());
        assert_eq!(
            upstream_options(
                UpstreamOptions {
                    load_balance: LoadBalance::Ewma,
                    load_balance_hash_key: Some("$remote_addr".to_string()),
                    ..record("app1", &[], 0)
                },
                &binds
            ),
            Err(Error::UnexpectedHashKey)
        );
    }

    #[test]
    fn canary_graph() {
        let records = vec![
            record("primary-1", &["canary-1"], 0),
            record("canary-1", &[], 10),
            record("app-2", &["primary-1"], 0),
        ];
        let err = upstream_graph(&records, "app-2").unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot be used as canary because it has its own canary binds"));

        let records = vec![
            record("primary-1", &["canary-1"], 0),
            record("canary-1", &["other"], 0),
            record("other", &[], 0),
        ];
        assert!(matches!(
            upstream_graph(&records, "canary-1"),
            Err(Error::CanaryCannotHaveCanaries { .. })
        ));

        let records = vec![
            record("primary-1", &["canary-1"], 0),
            record("primary-2", &["canary-1"], 0),
            record("canary-1", &[], 0),
        ];
        assert!(matches!(
            upstream_graph(&records, "primary-2"),
            Err(Error::DuplicateCanary { .. })
        ));

        let records = vec![record("primary-1", &["canary-1"], 0)];
        assert!(matches!(
            upstream_graph(&records, "primary-1"),
            Err(Error::CanaryWithoutOptions { .. })
        ));

        let records = vec![record("primary-1", &["canary-1"], 50), record("canary-1", &[], 0)];
        assert!(matches!(
            upstream_graph(&records, "primary-1"),
            Err(Error::TrafficShapingOnPrimary { .. })
        ));

        let records = vec![
            record("primary-1", &["canary-1"], 0),
            record("canary-1", &[], 20),
        ];
        assert!(upstream_graph(&records, "primary-1").is_ok());
        assert!(upstream_graph(&records, "canary-1").is_ok());
    }
}
